//! Forwarder 模块
//! Forwarder module
//!
//! 定期检查重试任务，将到期的任务转发到待处理队列
//! Periodically checks retry tasks and forwards due ones to the pending queue

use crate::base::Broker;
use crate::components::ComponentLifecycle;
use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Forwarder 配置
/// Forwarder configuration
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
  /// 检查间隔
  /// Check interval
  pub interval: Duration,
  /// 队列列表
  /// Queue list
  pub queues: Vec<String>,
}

impl Default for ForwarderConfig {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(5),
      queues: vec!["default".to_string()],
    }
  }
}

/// Forwarder - 负责转发已到期的重试任务
/// Forwarder - responsible for forwarding due retry tasks
pub struct Forwarder {
  broker: Arc<dyn Broker>,
  config: ForwarderConfig,
  done: AtomicBool,
  stop: CancellationToken,
}

impl Forwarder {
  /// 创建新的 Forwarder
  /// Create a new Forwarder
  pub fn new(broker: Arc<dyn Broker>, config: ForwarderConfig) -> Self {
    Self {
      broker,
      config,
      done: AtomicBool::new(false),
      stop: CancellationToken::new(),
    }
  }

  /// 执行一次转发
  /// Run one forwarding pass
  pub async fn forward(&self) -> Result<i64> {
    let moved = self.broker.forward_if_ready(&self.config.queues).await?;
    if moved > 0 {
      tracing::debug!("Forwarder: moved {} retry tasks to pending", moved);
    }
    Ok(moved)
  }
}

impl ComponentLifecycle for Forwarder {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(self.config.interval);
      loop {
        tokio::select! {
          _ = self.stop.cancelled() => {
            tracing::debug!("Forwarder: shutting down");
            break;
          }
          _ = interval.tick() => {
            if let Err(e) = self.forward().await {
              tracing::warn!("Forwarder: failed to forward ready tasks: {}", e);
            }
          }
        }
      }
    })
  }

  fn shutdown(&self) {
    self.done.store(true, Ordering::Relaxed);
    self.stop.cancel();
  }

  fn is_done(&self) -> bool {
    self.done.load(Ordering::Relaxed)
  }
}
