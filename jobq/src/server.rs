//! 服务器模块
//! Server module
//!
//! 组合 Processor、Forwarder、Recoverer 与 Heartbeat，提供任务处理服务器
//! Combines the Processor, Forwarder, Recoverer and Heartbeat into a task processing server

use crate::base::Broker;
use crate::components::forwarder::{Forwarder, ForwarderConfig};
use crate::components::heartbeat::Heartbeat;
use crate::components::processor::{Processor, ProcessorParams};
use crate::components::recoverer::{Recoverer, RecovererConfig};
use crate::components::ComponentLifecycle;
pub use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::rdb::RedisBroker;
use crate::redis::RedisConnectionConfig;
use crate::task::Task;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 任务处理器特性
/// Task handler trait
///
/// 返回 `Err` 时任务按重试策略重试；返回 [`SkipRetryError`](crate::error::SkipRetryError)
/// 包装的错误时直接归档
/// Returning `Err` retries the task per the retry policy; an error wrapped in
/// [`SkipRetryError`](crate::error::SkipRetryError) archives it directly
#[async_trait]
pub trait Handler: Send + Sync {
  /// 处理任务
  /// Process a task
  async fn process_task(&self, task: Task) -> Result<()>;
}

#[async_trait]
impl<H> Handler for Arc<H>
where
  H: Handler + ?Sized,
{
  async fn process_task(&self, task: Task) -> Result<()> {
    (**self).process_task(task).await
  }
}

/// 函数式处理器适配器
/// Functional handler adapter
pub struct HandlerFunc<F> {
  func: F,
}

impl<F> HandlerFunc<F>
where
  F: Fn(Task) -> Result<()> + Send + Sync,
{
  pub fn new(func: F) -> Self {
    Self { func }
  }
}

#[async_trait]
impl<F> Handler for HandlerFunc<F>
where
  F: Fn(Task) -> Result<()> + Send + Sync,
{
  async fn process_task(&self, task: Task) -> Result<()> {
    (self.func)(task)
  }
}

/// 异步函数式处理器适配器
/// Asynchronous functional handler adapter
pub struct AsyncHandlerFunc<F, Fut> {
  func: F,
  _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncHandlerFunc<F, Fut>
where
  F: Fn(Task) -> Fut + Send + Sync,
  Fut: Future<Output = Result<()>> + Send,
{
  pub fn new(func: F) -> Self {
    Self {
      func,
      _phantom: PhantomData,
    }
  }
}

#[async_trait]
impl<F, Fut> Handler for AsyncHandlerFunc<F, Fut>
where
  F: Fn(Task) -> Fut + Send + Sync,
  Fut: Future<Output = Result<()>> + Send,
{
  async fn process_task(&self, task: Task) -> Result<()> {
    (self.func)(task).await
  }
}

/// 服务器状态
/// Server state
#[derive(Debug, Clone, Copy, PartialEq)]
enum ServerState {
  New,
  Running,
  Closed,
}

/// 任务处理服务器
/// Task processing server
pub struct Server {
  broker: Arc<dyn Broker>,
  config: ServerConfig,
  state: ServerState,
  active_workers: Arc<AtomicUsize>,
  processor: Option<Processor>,
  components: Vec<(Arc<dyn ComponentLifecycle + Send + Sync>, JoinHandle<()>)>,
  // 外部触发 run() 返回
  // Lets callers make run() return
  shutdown_token: CancellationToken,
}

impl Server {
  /// 连接 Redis 并创建服务器
  /// Connect to Redis and create a server
  pub async fn new(redis_config: RedisConnectionConfig, config: ServerConfig) -> Result<Self> {
    let broker = RedisBroker::new(redis_config).await?;
    Self::with_broker(Arc::new(broker), config)
  }

  /// 使用已有的 Broker 创建服务器
  /// Create a server on top of an existing broker
  pub fn with_broker(broker: Arc<dyn Broker>, config: ServerConfig) -> Result<Self> {
    config.validate()?;
    Ok(Self {
      broker,
      config,
      state: ServerState::New,
      active_workers: Arc::new(AtomicUsize::new(0)),
      processor: None,
      components: Vec::new(),
      shutdown_token: CancellationToken::new(),
    })
  }

  /// 取消该令牌会让 [`Server::run`] 进入优雅关闭
  /// Cancelling this token makes [`Server::run`] shut down gracefully
  pub fn shutdown_token(&self) -> CancellationToken {
    self.shutdown_token.clone()
  }

  /// 当前正在执行的任务数
  /// Number of tasks currently executing
  pub fn active_workers(&self) -> usize {
    self.active_workers.load(Ordering::Relaxed)
  }

  /// 启动后台组件和处理器，立即返回
  /// Start the background components and the processor, returns immediately
  pub async fn start<H>(&mut self, handler: H) -> Result<()>
  where
    H: Handler + 'static,
  {
    if self.state != ServerState::New {
      return Err(Error::ServerRunning);
    }
    self.broker.ping().await?;
    self.state = ServerState::Running;

    let queues: Vec<String> = self.config.queues.keys().cloned().collect();

    let forwarder = Arc::new(Forwarder::new(
      Arc::clone(&self.broker),
      ForwarderConfig {
        interval: self.config.delayed_task_check_interval,
        queues: queues.clone(),
      },
    ));
    self.spawn_component(forwarder);

    let recoverer = Arc::new(Recoverer::new(
      Arc::clone(&self.broker),
      RecovererConfig {
        interval: self.config.recoverer_interval,
        queues: queues.clone(),
        retry_policy: self.config.retry_policy.clone(),
        ..Default::default()
      },
    ));
    self.spawn_component(recoverer);

    let mut processor = Processor::new(ProcessorParams {
      broker: Arc::clone(&self.broker),
      queues: self.config.queues.clone(),
      concurrency: self.config.concurrency,
      strict_priority: self.config.strict_priority,
      task_check_interval: self.config.task_check_interval,
      shutdown_timeout: self.config.shutdown_timeout,
      retry_policy: self.config.retry_policy.clone(),
      active_workers: Arc::clone(&self.active_workers),
    });
    processor.start(Arc::new(handler));

    let heartbeat = Arc::new(Heartbeat::new(
      Arc::clone(&self.broker),
      self.config.heartbeat_interval,
      processor.cancellations(),
    ));
    self.spawn_component(heartbeat);
    self.processor = Some(processor);

    tracing::info!(
      "Server started: concurrency={}, queues={:?}",
      self.config.concurrency,
      queues
    );
    Ok(())
  }

  fn spawn_component<C>(&mut self, component: Arc<C>)
  where
    C: ComponentLifecycle + Send + Sync + 'static,
  {
    let handle = component.clone().start();
    self.components.push((
      component as Arc<dyn ComponentLifecycle + Send + Sync>,
      handle,
    ));
  }

  /// 运行服务器直到收到停止信号，然后优雅关闭
  /// Run the server until a stop signal arrives, then shut down gracefully
  pub async fn run<H>(&mut self, handler: H) -> Result<()>
  where
    H: Handler + 'static,
  {
    self.start(handler).await?;
    self.wait_for_signal().await;
    self.shutdown().await
  }

  /// 关闭服务器
  /// Shutdown the server
  ///
  /// 停止取新任务，等待执行中的任务最多 `shutdown_timeout`，之后取消剩余任务并放回队列
  /// Stops fetching, waits up to `shutdown_timeout` for running tasks, then cancels
  /// the rest and puts them back on the queue
  pub async fn shutdown(&mut self) -> Result<()> {
    if self.state == ServerState::Closed {
      return Ok(());
    }
    self.state = ServerState::Closed;
    tracing::info!("Server shutting down");

    if let Some(processor) = self.processor.as_mut() {
      processor.shutdown().await;
    }

    for (component, handle) in self.components.drain(..) {
      component.shutdown();
      let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    self.broker.close().await?;
    tracing::info!("Server stopped");
    Ok(())
  }

  /// Ping broker
  pub async fn ping(&self) -> Result<()> {
    self.broker.ping().await
  }

  /// 等待 SIGINT、SIGTERM 或关闭令牌
  /// Wait for SIGINT, SIGTERM or the shutdown token
  async fn wait_for_signal(&self) {
    let terminate = async {
      #[cfg(unix)]
      {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
          Ok(mut stream) => {
            stream.recv().await;
          }
          Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
          }
        }
      }
      #[cfg(not(unix))]
      std::future::pending::<()>().await;
    };

    tokio::select! {
      _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
      _ = terminate => tracing::info!("Received SIGTERM"),
      _ = self.shutdown_token.cancelled() => tracing::info!("Shutdown requested"),
    }
  }
}

/// 服务器构建器
/// Server builder
#[derive(Default)]
pub struct ServerBuilder {
  redis_config: Option<RedisConnectionConfig>,
  broker: Option<Arc<dyn Broker>>,
  config: ServerConfig,
}

impl ServerBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// 设置 Redis 配置
  /// Set Redis configuration
  pub fn redis_config(mut self, config: RedisConnectionConfig) -> Self {
    self.redis_config = Some(config);
    self
  }

  /// 使用已有的 Broker，优先于 Redis 配置
  /// Use an existing broker, takes precedence over the Redis configuration
  pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
    self.broker = Some(broker);
    self
  }

  pub fn server_config(mut self, config: ServerConfig) -> Self {
    self.config = config;
    self
  }

  pub fn concurrency(mut self, concurrency: usize) -> Self {
    self.config = self.config.concurrency(concurrency);
    self
  }

  pub fn add_queue<S: AsRef<str>>(mut self, name: S, priority: i32) -> Result<Self> {
    self.config = self.config.add_queue(name, priority)?;
    Ok(self)
  }

  /// 构建服务器
  /// Build the server
  pub async fn build(self) -> Result<Server> {
    if let Some(broker) = self.broker {
      return Server::with_broker(broker, self.config);
    }
    let redis_config = self
      .redis_config
      .ok_or_else(|| Error::config("Redis configuration or broker is required"))?;
    Server::new(redis_config, self.config).await
  }
}
