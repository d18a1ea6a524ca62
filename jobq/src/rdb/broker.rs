//! Redis 经纪人的 Broker 特性实现
//! Broker trait implementation for the Redis broker

use super::redis_broker::RedisBroker;
use super::redis_scripts;
use crate::base::constants::{
  DEFAULT_ARCHIVED_EXPIRATION_IN_DAYS, DEFAULT_MAX_ARCHIVE_SIZE, LEASE_DURATION_SECS,
  STATS_TTL_DAYS,
};
use crate::base::keys::{self, TaskState};
use crate::base::{decode_message, encode_message, task_to_message, validate_queue_name, Broker};
use crate::error::{Error, Result};
use crate::proto::TaskMessage;
use crate::task::{QueueStats, Task, TaskInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// 完成任务时批量清理的已完成任务数
/// Number of expired completed tasks removed per forward pass
const COMPLETED_CLEANUP_BATCH: i64 = 100;

fn stats_expiration(now: &DateTime<Utc>) -> i64 {
  now.timestamp() + STATS_TTL_DAYS * 24 * 60 * 60
}

fn task_key_prefix(queue: &str) -> String {
  format!("{}t:", keys::queue_key_prefix(queue))
}

#[async_trait]
impl Broker for RedisBroker {
  async fn ping(&self) -> Result<()> {
    let mut conn = self.connection();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    // 多路复用连接随最后一个克隆释放
    // The multiplexed connection is released with its last clone
    Ok(())
  }

  async fn enqueue(&self, task: &Task) -> Result<TaskInfo> {
    let msg = task_to_message(task);
    validate_queue_name(&msg.queue)?;
    let encoded = encode_message(&msg)?;
    let now_nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();

    let mut conn = self.connection();
    let _: () = redis::cmd("SADD")
      .arg(keys::ALL_QUEUES)
      .arg(&msg.queue)
      .query_async(&mut conn)
      .await?;

    let added: i64 = redis_scripts::ENQUEUE
      .key(keys::task_key(&msg.queue, &msg.id))
      .key(keys::pending_key(&msg.queue))
      .arg(encoded)
      .arg(&msg.id)
      .arg(now_nanos)
      .invoke_async(&mut conn)
      .await?;
    if added == 0 {
      return Err(Error::TaskIdConflict);
    }

    Ok(TaskInfo::from_proto(&msg, TaskState::Pending, None))
  }

  async fn dequeue(&self, queues: &[String]) -> Result<Option<TaskMessage>> {
    let mut conn = self.connection();
    let lease_expiry = Utc::now().timestamp() + LEASE_DURATION_SECS;

    for queue in queues {
      let data: Option<Vec<u8>> = redis_scripts::DEQUEUE
        .key(keys::pending_key(queue))
        .key(keys::paused_key(queue))
        .key(keys::active_key(queue))
        .key(keys::lease_key(queue))
        .arg(lease_expiry)
        .arg(task_key_prefix(queue))
        .invoke_async(&mut conn)
        .await?;
      if let Some(data) = data {
        return decode_message(&data).map(Some);
      }
    }

    Ok(None)
  }

  async fn done(&self, msg: &TaskMessage) -> Result<()> {
    let now = Utc::now();
    let mut conn = self.connection();

    if msg.retention > 0 {
      let mut completed = msg.clone();
      completed.completed_at = now.timestamp();
      let _: () = redis_scripts::MARK_AS_COMPLETE
        .key(keys::active_key(&msg.queue))
        .key(keys::lease_key(&msg.queue))
        .key(keys::completed_key(&msg.queue))
        .key(keys::task_key(&msg.queue, &msg.id))
        .key(keys::processed_key(&msg.queue, &now))
        .key(keys::processed_total_key(&msg.queue))
        .arg(&msg.id)
        .arg(stats_expiration(&now))
        .arg(now.timestamp() + msg.retention)
        .arg(encode_message(&completed)?)
        .arg(i64::MAX)
        .invoke_async(&mut conn)
        .await?;
    } else {
      let _: () = redis_scripts::DONE
        .key(keys::active_key(&msg.queue))
        .key(keys::lease_key(&msg.queue))
        .key(keys::task_key(&msg.queue, &msg.id))
        .key(keys::processed_key(&msg.queue, &now))
        .key(keys::processed_total_key(&msg.queue))
        .arg(&msg.id)
        .arg(stats_expiration(&now))
        .arg(i64::MAX)
        .invoke_async(&mut conn)
        .await?;
    }
    Ok(())
  }

  async fn requeue(&self, msg: &TaskMessage) -> Result<()> {
    let mut conn = self.connection();
    let _: () = redis_scripts::REQUEUE
      .key(keys::active_key(&msg.queue))
      .key(keys::lease_key(&msg.queue))
      .key(keys::pending_key(&msg.queue))
      .key(keys::task_key(&msg.queue, &msg.id))
      .arg(&msg.id)
      .invoke_async(&mut conn)
      .await?;
    Ok(())
  }

  async fn retry(
    &self,
    msg: &TaskMessage,
    process_at: DateTime<Utc>,
    error_msg: &str,
  ) -> Result<()> {
    let now = Utc::now();
    let mut updated = msg.clone();
    updated.retried += 1;
    updated.error_msg = error_msg.to_string();
    updated.last_failed_at = now.timestamp();

    let mut conn = self.connection();
    let _: () = redis_scripts::RETRY
      .key(keys::task_key(&msg.queue, &msg.id))
      .key(keys::active_key(&msg.queue))
      .key(keys::lease_key(&msg.queue))
      .key(keys::retry_key(&msg.queue))
      .key(keys::processed_key(&msg.queue, &now))
      .key(keys::failed_key(&msg.queue, &now))
      .key(keys::processed_total_key(&msg.queue))
      .key(keys::failed_total_key(&msg.queue))
      .arg(&msg.id)
      .arg(encode_message(&updated)?)
      .arg(process_at.timestamp())
      .arg(stats_expiration(&now))
      .arg(i64::MAX)
      .invoke_async(&mut conn)
      .await?;
    Ok(())
  }

  async fn archive(&self, msg: &TaskMessage, error_msg: &str) -> Result<()> {
    let now = Utc::now();
    let cutoff = now.timestamp() - DEFAULT_ARCHIVED_EXPIRATION_IN_DAYS * 24 * 60 * 60;
    let mut updated = msg.clone();
    updated.error_msg = error_msg.to_string();
    updated.last_failed_at = now.timestamp();

    let mut conn = self.connection();
    let _: () = redis_scripts::ARCHIVE
      .key(keys::task_key(&msg.queue, &msg.id))
      .key(keys::active_key(&msg.queue))
      .key(keys::lease_key(&msg.queue))
      .key(keys::archived_key(&msg.queue))
      .key(keys::processed_key(&msg.queue, &now))
      .key(keys::failed_key(&msg.queue, &now))
      .key(keys::processed_total_key(&msg.queue))
      .key(keys::failed_total_key(&msg.queue))
      .key(task_key_prefix(&msg.queue))
      .arg(&msg.id)
      .arg(encode_message(&updated)?)
      .arg(now.timestamp())
      .arg(cutoff)
      .arg(DEFAULT_MAX_ARCHIVE_SIZE)
      .arg(stats_expiration(&now))
      .arg(i64::MAX)
      .invoke_async(&mut conn)
      .await?;
    Ok(())
  }

  async fn forward_if_ready(&self, queues: &[String]) -> Result<i64> {
    let now = Utc::now();
    let now_nanos = now.timestamp_nanos_opt().unwrap_or_default();
    let mut conn = self.connection();
    let mut forwarded = 0;

    for queue in queues {
      let moved: i64 = redis_scripts::FORWARD
        .key(keys::retry_key(queue))
        .key(keys::pending_key(queue))
        .arg(now.timestamp())
        .arg(task_key_prefix(queue))
        .arg(now_nanos)
        .invoke_async(&mut conn)
        .await?;
      forwarded += moved;

      let deleted: i64 = redis_scripts::DELETE_EXPIRED_COMPLETED
        .key(keys::completed_key(queue))
        .arg(now.timestamp())
        .arg(task_key_prefix(queue))
        .arg(COMPLETED_CLEANUP_BATCH)
        .invoke_async(&mut conn)
        .await?;
      if deleted > 0 {
        tracing::debug!("Deleted {} expired completed tasks from {}", deleted, queue);
      }
    }

    Ok(forwarded)
  }

  async fn list_lease_expired(
    &self,
    cutoff: DateTime<Utc>,
    queues: &[String],
  ) -> Result<Vec<TaskMessage>> {
    let mut conn = self.connection();
    let mut expired = Vec::new();

    for queue in queues {
      let data: Vec<Vec<u8>> = redis_scripts::LIST_LEASE_EXPIRED
        .key(keys::lease_key(queue))
        .arg(cutoff.timestamp())
        .arg(task_key_prefix(queue))
        .invoke_async(&mut conn)
        .await?;
      for bytes in data {
        expired.push(decode_message(&bytes)?);
      }
    }

    Ok(expired)
  }

  async fn extend_lease(&self, queue: &str, task_ids: &[String]) -> Result<DateTime<Utc>> {
    let expiry = Utc::now() + chrono::Duration::seconds(LEASE_DURATION_SECS);
    if task_ids.is_empty() {
      return Ok(expiry);
    }

    let mut conn = self.connection();
    let mut invocation = redis_scripts::EXTEND_LEASE.key(keys::lease_key(queue));
    invocation.arg(expiry.timestamp());
    for id in task_ids {
      invocation.arg(id);
    }
    let _: i64 = invocation.invoke_async(&mut conn).await?;
    Ok(expiry)
  }

  async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
    let mut conn = self.connection();
    let (pending, active, retry, archived, completed): (i64, i64, i64, i64, i64) = redis::pipe()
      .cmd("LLEN")
      .arg(keys::pending_key(queue))
      .cmd("LLEN")
      .arg(keys::active_key(queue))
      .cmd("ZCARD")
      .arg(keys::retry_key(queue))
      .cmd("ZCARD")
      .arg(keys::archived_key(queue))
      .cmd("ZCARD")
      .arg(keys::completed_key(queue))
      .query_async(&mut conn)
      .await?;

    Ok(QueueStats {
      name: queue.to_string(),
      pending,
      active,
      retry,
      archived,
      completed,
    })
  }
}
