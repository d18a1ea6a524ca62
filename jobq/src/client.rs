//! 客户端模块
//! Client module
//!
//! 提供任务入队功能
//! Provides task enqueuing

use crate::base::Broker;
use crate::error::Result;
use crate::rdb::RedisBroker;
use crate::redis::RedisConnectionConfig;
use crate::task::{QueueStats, Task, TaskInfo};
use std::sync::Arc;

/// 客户端，负责将任务入队
/// Client, responsible for enqueuing tasks
#[derive(Clone)]
pub struct Client {
  broker: Arc<dyn Broker>,
}

impl Client {
  /// 连接 Redis 并创建客户端
  /// Connect to Redis and create a client
  pub async fn new(redis_config: RedisConnectionConfig) -> Result<Self> {
    let broker = RedisBroker::new(redis_config).await?;
    Ok(Self::with_broker(Arc::new(broker)))
  }

  /// 使用已有的 Broker 创建客户端
  /// Create a client on top of an existing broker
  pub fn with_broker(broker: Arc<dyn Broker>) -> Self {
    Self { broker }
  }

  /// 将任务加入队列立即处理
  /// Enqueue a task for immediate processing
  pub async fn enqueue(&self, task: Task) -> Result<TaskInfo> {
    let info = self.broker.enqueue(&task).await?;
    tracing::debug!("Enqueued task {} ({}) to {}", info.id, info.task_type, info.queue);
    Ok(info)
  }

  /// 获取队列统计
  /// Get queue statistics
  pub async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
    self.broker.queue_stats(queue).await
  }

  /// Ping broker
  pub async fn ping(&self) -> Result<()> {
    self.broker.ping().await
  }

  /// 关闭客户端
  /// Close the client
  pub async fn close(&self) -> Result<()> {
    self.broker.close().await
  }
}
