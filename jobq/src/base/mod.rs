//! 经纪人模块
//! Broker module
//!
//! 定义了与任务存储后端交互的抽象层
//! Defines the abstraction layer for interacting with the task storage backend

use crate::base::constants::DEFAULT_QUEUE_NAME;
use crate::error::{Error, Result};
use crate::proto::TaskMessage;
use crate::task::{QueueStats, Task, TaskInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prost::Message;
use uuid::Uuid;

pub mod constants;
pub mod keys;

/// 经纪人特性，定义了与任务存储后端交互的接口
/// Broker trait, defines the interface for interacting with the task storage backend
///
/// 只包含处理器、转发器、恢复器、心跳和客户端需要的操作
/// Only contains the operations needed by the processor, forwarder, recoverer, heartbeat and client
#[async_trait]
pub trait Broker: Send + Sync {
  /// Ping 后端连接
  /// Ping the backend connection
  async fn ping(&self) -> Result<()>;

  /// 关闭连接
  /// Close connection
  async fn close(&self) -> Result<()>;

  /// 将任务加入待处理队列
  /// Enqueue a task into the pending queue
  async fn enqueue(&self, task: &Task) -> Result<TaskInfo>;

  /// 按给定顺序从队列中出队一个任务，并将其标记为活跃
  /// Dequeue one task from the queues in the given order and mark it active
  async fn dequeue(&self, queues: &[String]) -> Result<Option<TaskMessage>>;

  /// 任务成功：删除任务，或在设置了保留期时移入已完成集合
  /// Task succeeded: delete it, or move it to the completed set when retention is set
  async fn done(&self, msg: &TaskMessage) -> Result<()>;

  /// 将活跃任务放回待处理队列，不消耗重试次数（用于关闭时被取消的任务）
  /// Put an active task back to pending without consuming a retry (used for tasks cancelled at shutdown)
  async fn requeue(&self, msg: &TaskMessage) -> Result<()>;

  /// 任务失败：重试计数加一，并安排在 `process_at` 重试
  /// Task failed: increment the retry counter and schedule it for `process_at`
  async fn retry(&self, msg: &TaskMessage, process_at: DateTime<Utc>, error_msg: &str)
    -> Result<()>;

  /// 归档任务，不再重试
  /// Archive a task, it will not be retried again
  async fn archive(&self, msg: &TaskMessage, error_msg: &str) -> Result<()>;

  /// 将到期的重试任务移回待处理队列，返回移动的数量
  /// Move due retry tasks back to pending, returns how many were moved
  async fn forward_if_ready(&self, queues: &[String]) -> Result<i64>;

  /// 列出租约在 `cutoff` 之前已过期的活跃任务（其工作者可能已崩溃）
  /// List active tasks whose lease expired before `cutoff` (their worker may have crashed)
  async fn list_lease_expired(
    &self,
    cutoff: DateTime<Utc>,
    queues: &[String],
  ) -> Result<Vec<TaskMessage>>;

  /// 为仍在运行的任务续租，返回新的过期时间
  /// Extend the lease of tasks that are still running, returns the new expiry
  async fn extend_lease(&self, queue: &str, task_ids: &[String]) -> Result<DateTime<Utc>>;

  /// 获取队列统计
  /// Get queue statistics
  async fn queue_stats(&self, queue: &str) -> Result<QueueStats>;
}

/// 从 Task 创建 TaskMessage
/// Create a TaskMessage from a Task
pub(crate) fn task_to_message(task: &Task) -> TaskMessage {
  TaskMessage {
    r#type: task.task_type.clone(),
    payload: task.payload.clone(),
    headers: task.headers.clone(),
    id: task
      .options
      .task_id
      .clone()
      .unwrap_or_else(|| Uuid::new_v4().to_string()),
    queue: if task.options.queue.is_empty() {
      DEFAULT_QUEUE_NAME.to_string()
    } else {
      task.options.queue.clone()
    },
    retry: task.options.max_retry,
    retried: 0,
    error_msg: String::new(),
    last_failed_at: 0,
    timeout: task
      .options
      .timeout
      .map(|d| d.as_secs() as i64)
      .unwrap_or(0),
    deadline: task.options.deadline.map(|d| d.timestamp()).unwrap_or(0),
    unique_key: String::new(),
    group_key: String::new(),
    retention: task
      .options
      .retention
      .map(|d| d.as_secs() as i64)
      .unwrap_or(0),
    completed_at: 0,
  }
}

/// 将任务消息编码为字节
/// Encode a task message to bytes
pub(crate) fn encode_message(msg: &TaskMessage) -> Result<Vec<u8>> {
  let mut buf = Vec::with_capacity(msg.encoded_len());
  msg.encode(&mut buf)?;
  Ok(buf)
}

/// 从字节解码任务消息
/// Decode a task message from bytes
pub(crate) fn decode_message(data: &[u8]) -> Result<TaskMessage> {
  TaskMessage::decode(data).map_err(Error::ProtoDecode)
}

/// 校验队列名称
/// Validate a queue name
pub(crate) fn validate_queue_name(name: &str) -> Result<()> {
  if name.trim().is_empty() {
    return Err(Error::InvalidQueueName {
      name: name.to_string(),
    });
  }
  Ok(())
}
