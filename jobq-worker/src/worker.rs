//! 工作者装配模块
//! Worker wiring module
//!
//! 把配置、存储和客户端组装成可运行的队列服务器
//! Wires settings, store and clients into a runnable queue server

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::callback::CallbackNotifier;
use crate::completion::CompletionClient;
use crate::handler::LlmTaskHandler;
use crate::metrics;
use crate::payload::TYPE_LLM;
use crate::settings::{QueueSettings, RedisSettings, Settings};
use crate::store::RecordStore;
use crate::url_guard::UrlGuard;
use jobq::base::constants::DEFAULT_QUEUE_NAME;
use jobq::client::Client;
use jobq::components::ComponentLifecycle;
use jobq::redis::RedisConnectionConfig;
use jobq::serve_mux::ServeMux;
use jobq::server::{Server, ServerConfig};
use jobq::task::RetryPolicy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 队列长度指标的刷新间隔
/// Refresh interval of the queue size metrics
pub const QUEUE_STATS_INTERVAL: Duration = Duration::from_secs(15);

/// 单个 `default` 队列，使用配置的并发数，第 `n` 次重试等待 `n * unit`
/// Single `default` queue, configured concurrency, retry `n` after `n * unit`
pub fn server_config(queue: &QueueSettings) -> ServerConfig {
  ServerConfig::new()
    .concurrency(queue.concurrency)
    .retry_policy(RetryPolicy::linear(Duration::from_secs(
      queue.retry_unit_secs,
    )))
}

/// 补全 API 的进程级断路器
/// The process-wide breaker for the completion API
///
/// 禁用时仍以默认阈值运行
/// A disabled breaker still runs with default thresholds
pub fn build_breaker(settings: &Settings) -> CircuitBreaker {
  match settings.breaker_config() {
    Some(config) => {
      tracing::info!(
        "Enabling circuit breaker for LLM API: fail_threshold={}, timeout={:?}, max_requests={}",
        config.fail_threshold,
        config.timeout,
        config.max_requests
      );
      CircuitBreaker::new(config)
    }
    None => {
      tracing::warn!("Circuit breaker is disabled for LLM API, falling back to defaults");
      CircuitBreaker::new(BreakerConfig::default())
    }
  }
}

/// 组装任务处理器：断路器、补全客户端和回调共享同一个 HTTP 连接池
/// Assemble the job handler; breaker, completion client and callbacks share one HTTP pool
pub fn build_handler(
  settings: &Settings,
  store: Arc<dyn RecordStore>,
  guard: UrlGuard,
) -> Result<LlmTaskHandler, reqwest::Error> {
  let breaker = Arc::new(build_breaker(settings));
  let completion = CompletionClient::new(settings.completion_config(), breaker)?;
  let callback = CallbackNotifier::new(completion.http_client(), guard);
  Ok(LlmTaskHandler::new(store, Arc::new(completion), callback))
}

/// 只注册 `llm:process` 的路由表
/// Routing table with only `llm:process` registered
pub fn routes(handler: LlmTaskHandler) -> ServeMux {
  let mut mux = ServeMux::new();
  mux.handle(TYPE_LLM, handler);
  mux
}

/// 连接 Redis 并创建队列服务器，同时发布工作者数量
/// Connect to Redis and create the queue server, publishing the worker count
pub async fn connect_server(
  redis: &RedisSettings,
  queue: &QueueSettings,
) -> jobq::error::Result<Server> {
  let server = Server::new(redis_config(redis)?, server_config(queue)).await?;
  metrics::set_workers(queue.concurrency);
  Ok(server)
}

/// 连接 Redis 并创建队列长度监视器
/// Connect to Redis and create the queue size monitor
pub async fn connect_queue_monitor(redis: &RedisSettings) -> jobq::error::Result<QueueSizeMonitor> {
  let client = Client::new(redis_config(redis)?).await?;
  Ok(QueueSizeMonitor::new(
    client,
    vec![DEFAULT_QUEUE_NAME.to_string()],
    QUEUE_STATS_INTERVAL,
  ))
}

fn redis_config(redis: &RedisSettings) -> jobq::error::Result<RedisConnectionConfig> {
  RedisConnectionConfig::from_parts(&redis.addr, redis.password(), redis.db)
}

/// 队列长度监视器：定期读取队列统计并发布为指标
/// Queue size monitor: periodically reads queue statistics and publishes them as metrics
pub struct QueueSizeMonitor {
  client: Client,
  queues: Vec<String>,
  interval: Duration,
  done: AtomicBool,
  stop: CancellationToken,
}

impl QueueSizeMonitor {
  pub fn new(client: Client, queues: Vec<String>, interval: Duration) -> Self {
    Self {
      client,
      queues,
      interval,
      done: AtomicBool::new(false),
      stop: CancellationToken::new(),
    }
  }

  /// 刷新一次，返回成功发布的队列数
  /// Refresh once, returns how many queues were published
  pub async fn refresh(&self) -> usize {
    let mut published = 0;
    for queue in &self.queues {
      match self.client.queue_stats(queue).await {
        Ok(stats) => {
          metrics::set_queue_size(&stats);
          published += 1;
        }
        Err(e) => tracing::warn!(queue = %queue, error = %e, "failed to read queue stats"),
      }
    }
    published
  }
}

impl ComponentLifecycle for QueueSizeMonitor {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      loop {
        tokio::select! {
          _ = self.stop.cancelled() => break,
          _ = ticker.tick() => {
            self.refresh().await;
          }
        }
      }
      tracing::debug!("queue size monitor stopped");
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
  use crate::breaker::BreakerState;

  #[test]
  fn test_server_config_from_queue_settings() {
    let queue = QueueSettings {
      concurrency: 7,
      retry: 2,
      retention_secs: 60,
      retry_unit_secs: 30,
    };
    let config = server_config(&queue);
    assert_eq!(config.concurrency, 7);
    assert!(config.queues.contains_key("default"));
    assert_eq!(
      config.retry_policy.calculate_delay(2),
      Duration::from_secs(60)
    );
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_queue_monitor_publishes_sizes() {
    use crate::metrics::testing::capture;
    use crate::metrics::QUEUE_SIZE;
    use jobq::memdb::MemoryBroker;
    use jobq::task::Task;

    let (published, captured) = capture(async {
      let client = Client::with_broker(Arc::new(MemoryBroker::new()));
      for _ in 0..3 {
        client
          .enqueue(Task::new(TYPE_LLM, b"{}").unwrap())
          .await
          .unwrap();
      }
      let monitor = Arc::new(QueueSizeMonitor::new(
        client,
        vec!["default".to_string()],
        Duration::from_millis(10),
      ));
      let handle = monitor.clone().start();
      tokio::time::sleep(Duration::from_millis(50)).await;
      monitor.shutdown();
      handle.await.unwrap();
      assert!(monitor.is_done());
      monitor.refresh().await
    });

    assert_eq!(published, 1);
    let pending = [("queue", "default"), ("state", "pending")];
    assert_eq!(captured.gauge(QUEUE_SIZE, &pending), Some(3.0));
  }

  #[test]
  fn test_disabled_breaker_uses_defaults() {
    let mut settings = Settings::default();
    settings.completion.circuit_breaker.enabled = false;
    settings.completion.circuit_breaker.max_requests = 99;
    let breaker = build_breaker(&settings);
    assert_eq!(breaker.name(), "llm-api");
    assert_eq!(breaker.state(), BreakerState::Closed);
  }
}
