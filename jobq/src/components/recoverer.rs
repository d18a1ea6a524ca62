//! Recoverer 模块
//! Recoverer module
//!
//! 定期恢复孤儿任务：处于 active 状态但租约已过期的任务，通常是其工作者进程已崩溃。
//! 还有重试次数的任务进入重试集合，否则归档。
//! Periodically recovers orphaned tasks: tasks still active whose lease has expired,
//! usually because their worker process crashed. Tasks with retries left go to the
//! retry set, the rest are archived.

use crate::base::Broker;
use crate::components::ComponentLifecycle;
use crate::error::Result;
use crate::proto::TaskMessage;
use crate::task::RetryPolicy;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 记录在任务上的错误信息
/// Error message recorded on recovered tasks
pub const LEASE_EXPIRED: &str = "lease expired";

/// Recoverer 配置
/// Recoverer configuration
#[derive(Debug, Clone)]
pub struct RecovererConfig {
  /// 恢复间隔
  /// Recovery interval
  pub interval: Duration,
  /// 队列列表
  /// Queue list
  pub queues: Vec<String>,
  /// 租约过期多久之后才视为孤儿任务
  /// How long past expiry a lease must be before its task counts as orphaned
  pub grace: Duration,
  /// 恢复的任务重新调度时使用的延迟策略
  /// Delay policy used when rescheduling recovered tasks
  pub retry_policy: RetryPolicy,
}

impl Default for RecovererConfig {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(8),
      queues: vec!["default".to_string()],
      grace: Duration::from_secs(30),
      retry_policy: RetryPolicy::default_exponential(),
    }
  }
}

/// Recoverer - 负责恢复孤儿任务
/// Recoverer - responsible for recovering orphaned tasks
pub struct Recoverer {
  broker: Arc<dyn Broker>,
  config: RecovererConfig,
  done: AtomicBool,
  stop: CancellationToken,
}

impl Recoverer {
  pub fn new(broker: Arc<dyn Broker>, config: RecovererConfig) -> Self {
    Self {
      broker,
      config,
      done: AtomicBool::new(false),
      stop: CancellationToken::new(),
    }
  }

  /// 执行一次恢复，返回恢复的任务数
  /// Run one recovery pass, returns how many tasks were recovered
  pub async fn recover(&self) -> Result<usize> {
    let grace = chrono::Duration::from_std(self.config.grace).unwrap_or(chrono::Duration::zero());
    let cutoff = Utc::now() - grace;
    let orphans = self
      .broker
      .list_lease_expired(cutoff, &self.config.queues)
      .await?;

    let mut recovered = 0;
    for msg in orphans {
      match self.recover_one(&msg).await {
        Ok(()) => recovered += 1,
        Err(e) => tracing::warn!("Recoverer: could not recover task {}: {}", msg.id, e),
      }
    }
    Ok(recovered)
  }

  async fn recover_one(&self, msg: &TaskMessage) -> Result<()> {
    if msg.retried >= msg.retry {
      tracing::warn!(
        "Recoverer: archiving task {} with expired lease ({}/{} retries used)",
        msg.id,
        msg.retried,
        msg.retry
      );
      return self.broker.archive(msg, LEASE_EXPIRED).await;
    }

    let delay = self.config.retry_policy.calculate_delay(msg.retried + 1);
    let retry_at =
      Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(1));
    tracing::warn!(
      "Recoverer: task {} lost its worker, retrying in {:?}",
      msg.id,
      delay
    );
    self.broker.retry(msg, retry_at, LEASE_EXPIRED).await
  }
}

impl ComponentLifecycle for Recoverer {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(self.config.interval);
      loop {
        tokio::select! {
          _ = self.stop.cancelled() => {
            tracing::debug!("Recoverer: shutting down");
            break;
          }
          _ = interval.tick() => {
            if let Err(e) = self.recover().await {
              tracing::error!("Recoverer error: {}", e);
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

#[cfg(test)]
mod tests {
  use super::*;
  use crate::memdb::MemoryBroker;
  use crate::task::Task;

  async fn orphan(broker: &MemoryBroker, task: Task) -> TaskMessage {
    broker.enqueue(&task).await.unwrap();
    let msg = broker
      .dequeue(&["default".to_string()])
      .await
      .unwrap()
      .unwrap();
    broker
      .storage()
      .write()
      .await
      .get_or_create_queue("default")
      .lease
      .insert(msg.id.clone(), Utc::now().timestamp() - 120);
    msg
  }

  fn recoverer(broker: Arc<MemoryBroker>) -> Recoverer {
    Recoverer::new(
      broker,
      RecovererConfig {
        retry_policy: RetryPolicy::Fixed(Duration::ZERO),
        ..Default::default()
      },
    )
  }

  #[test]
  fn test_recoverer_config_default() {
    let config = RecovererConfig::default();
    assert_eq!(config.interval, Duration::from_secs(8));
    assert_eq!(config.grace, Duration::from_secs(30));
    assert_eq!(config.queues, vec!["default".to_string()]);
  }

  #[tokio::test]
  async fn test_orphan_with_retries_left_is_retried() {
    let broker = Arc::new(MemoryBroker::new());
    let msg = orphan(&broker, Task::new("t", b"").unwrap().with_max_retry(3)).await;

    assert_eq!(recoverer(broker.clone()).recover().await.unwrap(), 1);

    let stats = broker.queue_stats("default").await.unwrap();
    assert_eq!((stats.active, stats.retry), (0, 1));
    let stored = broker.get_task("default", &msg.id).await.unwrap();
    assert_eq!(stored.retried, 1);
    assert_eq!(stored.error_msg, LEASE_EXPIRED);
  }

  #[tokio::test]
  async fn test_orphan_without_retries_is_archived() {
    let broker = Arc::new(MemoryBroker::new());
    orphan(&broker, Task::new("t", b"").unwrap().with_max_retry(0)).await;

    assert_eq!(recoverer(broker.clone()).recover().await.unwrap(), 1);

    let stats = broker.queue_stats("default").await.unwrap();
    assert_eq!((stats.active, stats.archived), (0, 1));
  }

  #[tokio::test]
  async fn test_live_lease_is_left_alone() {
    let broker = Arc::new(MemoryBroker::new());
    broker.enqueue(&Task::new("t", b"").unwrap()).await.unwrap();
    broker
      .dequeue(&["default".to_string()])
      .await
      .unwrap()
      .unwrap();

    assert_eq!(recoverer(broker.clone()).recover().await.unwrap(), 0);
    assert_eq!(broker.queue_stats("default").await.unwrap().active, 1);
  }
}
