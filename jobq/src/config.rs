//! 配置模块
//! Configuration module
//!
//! 定义了服务器的配置选项
//! Defines configuration options for the server

use crate::base::constants::{DEFAULT_QUEUE_NAME, LEASE_DURATION_SECS};
use crate::error::{Error, Result};
use crate::task::RetryPolicy;
use std::collections::HashMap;
use std::time::Duration;

/// 服务器配置
/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
  /// 并发工作者数量
  /// Number of concurrent workers
  pub concurrency: usize,
  /// 队列配置，键为队列名称，值为优先级
  /// Queue configuration, key is queue name, value is priority
  pub queues: HashMap<String, i32>,
  /// 是否使用严格优先级
  /// Whether to use strict priority
  pub strict_priority: bool,
  /// 队列为空时的轮询间隔
  /// Poll interval when the queues are empty
  pub task_check_interval: Duration,
  /// 重试任务转发检查间隔
  /// Interval for forwarding due retry tasks
  pub delayed_task_check_interval: Duration,
  /// 为运行中的任务续租的间隔，必须小于租约时长
  /// Interval for extending the lease of running tasks, must be shorter than the lease
  pub heartbeat_interval: Duration,
  /// 检查租约过期的孤儿任务的间隔
  /// Interval for checking orphaned tasks with expired leases
  pub recoverer_interval: Duration,
  /// 关闭超时时间，超时后取消仍在运行的任务
  /// Shutdown timeout, in-flight tasks are cancelled after it elapses
  pub shutdown_timeout: Duration,
  /// 任务未指定策略时使用的重试延迟策略
  /// Retry delay policy used when a task does not specify one
  pub retry_policy: RetryPolicy,
}

impl Default for ServerConfig {
  fn default() -> Self {
    let mut queues = HashMap::new();
    queues.insert(DEFAULT_QUEUE_NAME.to_string(), 1);

    Self {
      concurrency: num_cpus::get(),
      queues,
      strict_priority: false,
      task_check_interval: Duration::from_secs(1),
      delayed_task_check_interval: Duration::from_secs(5),
      heartbeat_interval: Duration::from_secs(5),
      recoverer_interval: Duration::from_secs(8),
      shutdown_timeout: Duration::from_secs(8),
      retry_policy: RetryPolicy::default_exponential(),
    }
  }
}

impl ServerConfig {
  /// 创建新的服务器配置
  /// Create a new server configuration
  pub fn new() -> Self {
    Self::default()
  }

  /// 设置并发数
  /// Set the number of concurrent workers
  pub fn concurrency(mut self, concurrency: usize) -> Self {
    self.concurrency = concurrency.max(1);
    self
  }

  /// 设置队列配置
  /// Set the queue configuration
  pub fn queues(mut self, queues: HashMap<String, i32>) -> Self {
    if queues.is_empty() {
      let mut default_queues = HashMap::new();
      default_queues.insert(DEFAULT_QUEUE_NAME.to_string(), 1);
      self.queues = default_queues;
    } else {
      self.queues = queues;
    }
    self
  }

  /// 添加队列
  /// Add a queue
  pub fn add_queue<S: AsRef<str>>(mut self, name: S, priority: i32) -> Result<Self> {
    let name = name.as_ref();
    if name.trim().is_empty() {
      return Err(Error::InvalidQueueName {
        name: name.to_string(),
      });
    }
    if priority <= 0 {
      return Err(Error::config("Queue priority must be positive"));
    }
    self.queues.insert(name.to_string(), priority);
    Ok(self)
  }

  /// 设置严格优先级
  /// Set strict priority
  pub fn strict_priority(mut self, strict: bool) -> Self {
    self.strict_priority = strict;
    self
  }

  pub fn task_check_interval(mut self, interval: Duration) -> Self {
    self.task_check_interval = interval;
    self
  }

  pub fn delayed_task_check_interval(mut self, interval: Duration) -> Self {
    self.delayed_task_check_interval = interval;
    self
  }

  pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
    self.heartbeat_interval = interval;
    self
  }

  pub fn recoverer_interval(mut self, interval: Duration) -> Self {
    self.recoverer_interval = interval;
    self
  }

  /// 设置关闭超时时间
  /// Set the shutdown timeout
  pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
    self.shutdown_timeout = timeout;
    self
  }

  /// 设置默认重试策略
  /// Set the default retry policy
  pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
    self.retry_policy = policy;
    self
  }

  /// 验证配置
  /// Validate the configuration
  pub fn validate(&self) -> Result<()> {
    if self.concurrency == 0 {
      return Err(Error::config("Concurrency must be greater than 0"));
    }

    if self.queues.is_empty() {
      return Err(Error::config("At least one queue must be configured"));
    }

    for (name, priority) in &self.queues {
      if name.trim().is_empty() {
        return Err(Error::InvalidQueueName { name: name.clone() });
      }
      if *priority <= 0 {
        return Err(Error::config("Queue priority must be positive"));
      }
    }

    if self.task_check_interval.is_zero() || self.delayed_task_check_interval.is_zero() {
      return Err(Error::config("Check intervals must be greater than 0"));
    }

    if self.heartbeat_interval.is_zero() || self.recoverer_interval.is_zero() {
      return Err(Error::config(
        "Heartbeat and recoverer intervals must be greater than 0",
      ));
    }
    if self.heartbeat_interval.as_secs() >= LEASE_DURATION_SECS as u64 {
      return Err(Error::config(format!(
        "Heartbeat interval must be shorter than the {}s lease",
        LEASE_DURATION_SECS
      )));
    }

    Ok(())
  }
}
