//! Heartbeat 模块
//! Heartbeat module
//!
//! 周期性为正在执行的任务续租，使恢复器不会把仍在运行的任务当作孤儿任务
//! Periodically extends the lease of running tasks so the recoverer never treats
//! them as orphans

use crate::base::Broker;
use crate::components::processor::CancellationMap;
use crate::components::ComponentLifecycle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 心跳器：续租处理器中正在运行的任务
/// Heartbeat: renews the leases of tasks running in the processor
pub struct Heartbeat {
  broker: Arc<dyn Broker>,
  interval: Duration,
  running: CancellationMap,
  done: AtomicBool,
  stop: CancellationToken,
}

impl Heartbeat {
  pub fn new(broker: Arc<dyn Broker>, interval: Duration, running: CancellationMap) -> Self {
    Self {
      broker,
      interval,
      running,
      done: AtomicBool::new(false),
      stop: CancellationToken::new(),
    }
  }

  /// 为所有正在运行的任务续租一次，返回续租的任务数
  /// Extend every running task's lease once, returns how many were extended
  pub async fn beat(&self) -> usize {
    let mut extended = 0;
    for (queue, ids) in self.running.running_by_queue() {
      match self.broker.extend_lease(&queue, &ids).await {
        Ok(_) => extended += ids.len(),
        Err(e) => tracing::warn!("Heartbeat: could not extend leases in {}: {}", queue, e),
      }
    }
    extended
  }
}

impl ComponentLifecycle for Heartbeat {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      loop {
        tokio::select! {
          _ = self.stop.cancelled() => break,
          _ = ticker.tick() => {
            self.beat().await;
          }
        }
      }
      tracing::debug!("Heartbeat: shutting down");
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
