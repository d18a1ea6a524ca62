//! 内存经纪人的 Broker 特性实现
//! Broker trait implementation for the memory broker

use super::memory_broker::{MemoryBroker, MemoryStorage, QueueData};
use crate::base::constants::{
  DEFAULT_ARCHIVED_EXPIRATION_IN_DAYS, DEFAULT_MAX_ARCHIVE_SIZE, LEASE_DURATION_SECS,
};
use crate::base::keys::TaskState;
use crate::base::{task_to_message, validate_queue_name, Broker};
use crate::error::{Error, Result};
use crate::proto::TaskMessage;
use crate::task::{QueueStats, Task, TaskInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
impl Broker for MemoryBroker {
  async fn ping(&self) -> Result<()> {
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    Ok(())
  }

  async fn enqueue(&self, task: &Task) -> Result<TaskInfo> {
    let msg = task_to_message(task);
    validate_queue_name(&msg.queue)?;

    let mut storage = self.storage.write().await;
    let task_key = MemoryStorage::task_key(&msg.queue, &msg.id);

    // 检查任务是否已存在
    // Check if task already exists
    if storage.tasks.contains_key(&task_key) {
      return Err(Error::TaskIdConflict);
    }
    storage.tasks.insert(task_key, msg.clone());
    storage
      .get_or_create_queue(&msg.queue)
      .pending
      .push_back(msg.id.clone());

    Ok(TaskInfo::from_proto(&msg, TaskState::Pending, None))
  }

  async fn dequeue(&self, queues: &[String]) -> Result<Option<TaskMessage>> {
    let lease_expiry = Utc::now().timestamp() + LEASE_DURATION_SECS;
    let mut guard = self.storage.write().await;
    let storage = &mut *guard;

    for queue in queues {
      let Some(queue_data) = storage.queue_data.get_mut(queue) else {
        continue;
      };
      while let Some(task_id) = queue_data.pending.pop_front() {
        let task_key = MemoryStorage::task_key(queue, &task_id);
        // 被删除的任务可能仍留在列表中，跳过即可
        // Deleted tasks may still sit in the list, skip them
        let Some(msg) = storage.tasks.get(&task_key).cloned() else {
          continue;
        };
        queue_data.lease.insert(task_id.clone(), lease_expiry);
        queue_data.active.insert(task_id);
        return Ok(Some(msg));
      }
    }

    Ok(None)
  }

  async fn done(&self, msg: &TaskMessage) -> Result<()> {
    let now = Utc::now().timestamp();
    let mut storage = self.storage.write().await;
    let task_key = MemoryStorage::task_key(&msg.queue, &msg.id);

    let queue_data = storage.get_or_create_queue(&msg.queue);
    queue_data.release(&msg.id);
    queue_data.processed_total += 1;

    if msg.retention > 0 {
      // 保留到 retention 过期
      // Keep until retention expires
      queue_data
        .completed
        .entry(now + msg.retention)
        .or_default()
        .push(msg.id.clone());
      let mut completed = msg.clone();
      completed.completed_at = now;
      storage.tasks.insert(task_key, completed);
    } else {
      storage.tasks.remove(&task_key);
    }

    Ok(())
  }

  async fn requeue(&self, msg: &TaskMessage) -> Result<()> {
    let mut storage = self.storage.write().await;
    let queue_data = storage.get_or_create_queue(&msg.queue);
    queue_data.release(&msg.id);
    // 放回队首，尽快重新处理
    // Put back at the head so it is picked up first
    queue_data.pending.push_front(msg.id.clone());
    Ok(())
  }

  async fn retry(
    &self,
    msg: &TaskMessage,
    process_at: DateTime<Utc>,
    error_msg: &str,
  ) -> Result<()> {
    let mut msg = msg.clone();
    msg.retried += 1;
    msg.error_msg = error_msg.to_string();
    msg.last_failed_at = Utc::now().timestamp();

    let mut storage = self.storage.write().await;
    let task_key = MemoryStorage::task_key(&msg.queue, &msg.id);

    let queue_data = storage.get_or_create_queue(&msg.queue);
    queue_data.release(&msg.id);
    queue_data
      .retry
      .entry(process_at.timestamp())
      .or_default()
      .push(msg.id.clone());
    queue_data.processed_total += 1;
    queue_data.failed_total += 1;

    storage.tasks.insert(task_key, msg);
    Ok(())
  }

  async fn archive(&self, msg: &TaskMessage, error_msg: &str) -> Result<()> {
    let now = Utc::now().timestamp();
    let cutoff = now - DEFAULT_ARCHIVED_EXPIRATION_IN_DAYS * 24 * 60 * 60;

    let mut archived_msg = msg.clone();
    archived_msg.error_msg = error_msg.to_string();
    archived_msg.last_failed_at = now;

    let mut storage = self.storage.write().await;
    let task_key = MemoryStorage::task_key(&msg.queue, &msg.id);

    let queue_data = storage.get_or_create_queue(&msg.queue);
    queue_data.release(&msg.id);
    queue_data.archived.entry(now).or_default().push(msg.id.clone());
    queue_data.processed_total += 1;
    queue_data.failed_total += 1;

    // 清理过期的或超出容量的归档任务
    // Trim archived tasks that are too old or over capacity
    let mut evicted = Vec::new();
    let expired: Vec<i64> = queue_data.archived.range(..cutoff).map(|(k, _)| *k).collect();
    for score in expired {
      if let Some(ids) = queue_data.archived.remove(&score) {
        evicted.extend(ids);
      }
    }
    while QueueData::sorted_len(&queue_data.archived) > DEFAULT_MAX_ARCHIVE_SIZE {
      let Some((_, ids)) = queue_data.archived.pop_first() else {
        break;
      };
      evicted.extend(ids);
    }

    for id in evicted {
      storage
        .tasks
        .remove(&MemoryStorage::task_key(&msg.queue, &id));
    }
    storage.tasks.insert(task_key, archived_msg);
    Ok(())
  }

  async fn forward_if_ready(&self, queues: &[String]) -> Result<i64> {
    let now = Utc::now().timestamp();
    let mut storage = self.storage.write().await;
    let mut forwarded = 0;
    let mut expired = Vec::new();

    for queue in queues {
      let Some(queue_data) = storage.queue_data.get_mut(queue) else {
        continue;
      };

      let due: Vec<i64> = queue_data.retry.range(..=now).map(|(k, _)| *k).collect();
      for score in due {
        if let Some(ids) = queue_data.retry.remove(&score) {
          forwarded += ids.len() as i64;
          queue_data.pending.extend(ids);
        }
      }

      let done: Vec<i64> = queue_data.completed.range(..=now).map(|(k, _)| *k).collect();
      for score in done {
        if let Some(ids) = queue_data.completed.remove(&score) {
          expired.extend(ids.into_iter().map(|id| MemoryStorage::task_key(queue, &id)));
        }
      }
    }

    for key in expired {
      storage.tasks.remove(&key);
    }

    Ok(forwarded)
  }

  async fn list_lease_expired(
    &self,
    cutoff: DateTime<Utc>,
    queues: &[String],
  ) -> Result<Vec<TaskMessage>> {
    let cutoff = cutoff.timestamp();
    let storage = self.storage.read().await;
    let mut expired = Vec::new();

    for queue in queues {
      let Some(queue_data) = storage.queue_data.get(queue) else {
        continue;
      };
      for (task_id, &expiry) in &queue_data.lease {
        if expiry > cutoff {
          continue;
        }
        if let Some(msg) = storage.tasks.get(&MemoryStorage::task_key(queue, task_id)) {
          expired.push(msg.clone());
        }
      }
    }

    Ok(expired)
  }

  async fn extend_lease(&self, queue: &str, task_ids: &[String]) -> Result<DateTime<Utc>> {
    let now = Utc::now();
    let expiry = now.timestamp() + LEASE_DURATION_SECS;
    let mut storage = self.storage.write().await;

    if let Some(queue_data) = storage.queue_data.get_mut(queue) {
      for id in task_ids {
        // 只续租仍持有租约的任务
        // Only tasks that still hold a lease are extended
        if let Some(lease) = queue_data.lease.get_mut(id) {
          *lease = expiry;
        }
      }
    }

    Ok(now + chrono::Duration::seconds(LEASE_DURATION_SECS))
  }

  async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
    let storage = self.storage.read().await;
    let Some(queue_data) = storage.queue_data.get(queue) else {
      return Ok(QueueStats {
        name: queue.to_string(),
        ..Default::default()
      });
    };

    Ok(QueueStats {
      name: queue.to_string(),
      pending: queue_data.pending.len() as i64,
      active: queue_data.active.len() as i64,
      retry: QueueData::sorted_len(&queue_data.retry),
      archived: QueueData::sorted_len(&queue_data.archived),
      completed: QueueData::sorted_len(&queue_data.completed),
    })
  }
}
