//! 任务模块
//! Task module
//!
//! 定义了任务相关的数据结构和功能
//! Defines data structures and functions related to tasks

use crate::base::constants::{DEFAULT_MAX_RETRY, DEFAULT_QUEUE_NAME};
use crate::base::keys::TaskState;
use crate::error::{Error, Result};
use crate::proto;
use chrono::{DateTime, Utc};
#[cfg(feature = "json")]
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// 重试策略
/// Retry policy
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
  /// 固定延迟
  /// Fixed delay
  Fixed(Duration),
  /// 线性退避：`base_delay + step * n`，不超过 `max_delay`
  /// Linear backoff: `base_delay + step * n`, capped at `max_delay`
  Linear {
    base_delay: Duration,
    max_delay: Duration,
    step: Duration,
  },
  /// 指数退避
  /// Exponential backoff
  Exponential {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    /// 是否添加 ±25% 随机抖动
    /// Whether to add ±25% random jitter
    jitter: bool,
  },
}

impl RetryPolicy {
  /// 每次重试多等一个 `unit`：第 n 次失败后等待 `n * unit`
  /// Each retry waits one more `unit`: after the n-th failure wait `n * unit`
  pub fn linear(unit: Duration) -> Self {
    Self::Linear {
      base_delay: Duration::ZERO,
      max_delay: Duration::MAX,
      step: unit,
    }
  }

  /// 根据失败次数计算延迟
  /// Calculate the delay for the given failure count
  pub fn calculate_delay(&self, failures: i32) -> Duration {
    let failures = failures.max(0) as u32;
    match self {
      RetryPolicy::Fixed(delay) => *delay,
      RetryPolicy::Linear {
        base_delay,
        max_delay,
        step,
      } => step
        .checked_mul(failures)
        .and_then(|d| d.checked_add(*base_delay))
        .map_or(*max_delay, |d| d.min(*max_delay)),
      RetryPolicy::Exponential {
        base_delay,
        max_delay,
        multiplier,
        jitter,
      } => {
        let mut delay = base_delay.as_secs_f64() * multiplier.powi(failures as i32);
        if !delay.is_finite() || delay > max_delay.as_secs_f64() {
          delay = max_delay.as_secs_f64();
        }

        if *jitter {
          use rand::Rng;
          let mut rng = rand::rng();
          delay *= rng.random_range(0.75..=1.25);
        }

        Duration::from_secs_f64(delay)
      }
    }
  }

  /// 默认指数退避策略
  /// Default exponential backoff policy
  pub fn default_exponential() -> Self {
    Self::Exponential {
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(3600),
      multiplier: 2.0,
      jitter: true,
    }
  }
}

/// 任务选项
/// Task options
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOptions {
  /// 任务 ID，为空时自动生成
  /// Task ID, generated when empty
  pub task_id: Option<String>,
  pub queue: String,
  pub max_retry: i32,
  pub timeout: Option<Duration>,
  pub deadline: Option<DateTime<Utc>>,
  /// 完成后保留时长
  /// Retention after completion
  pub retention: Option<Duration>,
}

impl Default for TaskOptions {
  fn default() -> Self {
    Self {
      task_id: None,
      queue: DEFAULT_QUEUE_NAME.to_string(),
      max_retry: DEFAULT_MAX_RETRY,
      timeout: None,
      deadline: None,
      retention: None,
    }
  }
}

/// 处理中任务的运行时元数据
/// Runtime metadata of a task being processed
///
/// 只有传递给 Handler::process_task 的任务才带有元数据
/// Only tasks passed to Handler::process_task carry metadata
#[derive(Debug, Clone, PartialEq)]
pub struct TaskMetadata {
  pub id: String,
  pub queue: String,
  /// 已失败的次数
  /// Number of failures so far
  pub retried: i32,
  pub max_retry: i32,
}

/// 表示要执行的工作单元的任务
/// Represents a task as a unit of work to be executed
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
  /// 任务类型名称
  /// Task type name
  pub task_type: String,
  /// 任务负载数据
  /// Task payload data
  pub payload: Vec<u8>,
  pub headers: HashMap<String, String>,
  pub options: TaskOptions,
  metadata: Option<TaskMetadata>,
}

impl Task {
  /// 创建新任务
  /// Create a new task
  pub fn new<T: AsRef<str>>(task_type: T, payload: &[u8]) -> Result<Self> {
    let task_type = task_type.as_ref();
    if task_type.trim().is_empty() {
      return Err(Error::InvalidTaskType {
        task_type: task_type.to_string(),
      });
    }

    Ok(Self {
      task_type: task_type.to_string(),
      payload: payload.to_vec(),
      headers: HashMap::new(),
      options: TaskOptions::default(),
      metadata: None,
    })
  }

  #[cfg(feature = "json")]
  /// 使用 JSON 负载创建新任务
  /// Create a new task with JSON payload
  pub fn new_with_json<T: AsRef<str>, P: Serialize>(task_type: T, payload: &P) -> Result<Self> {
    let json_payload = serde_json::to_vec(payload)?;
    Self::new(task_type, &json_payload)
  }

  /// 设置任务选项
  /// Set task options
  pub fn with_options(mut self, options: TaskOptions) -> Self {
    self.options = options;
    self
  }

  /// 设置队列名称
  /// Set queue name
  pub fn with_queue<T: AsRef<str>>(mut self, queue: T) -> Self {
    self.options.queue = queue.as_ref().to_string();
    self
  }

  /// 设置最大重试次数
  /// Set maximum retry attempts
  pub fn with_max_retry(mut self, max_retry: i32) -> Self {
    self.options.max_retry = max_retry.max(0);
    self
  }

  /// 设置任务超时
  /// Set task timeout
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.options.timeout = Some(timeout);
    self
  }

  /// 设置任务截止时间
  /// Set task deadline
  pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
    self.options.deadline = Some(deadline);
    self
  }

  /// 设置任务 ID
  /// Set task ID
  pub fn with_task_id<T: AsRef<str>>(mut self, id: T) -> Self {
    self.options.task_id = Some(id.as_ref().to_string());
    self
  }

  /// 设置完成结果保留时间
  /// Set retention time after completion
  pub fn with_retention(mut self, retention: Duration) -> Self {
    self.options.retention = Some(retention);
    self
  }

  pub fn with_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
    self.headers.insert(key.into(), value.into());
    self
  }

  /// 获取任务类型
  /// Get task type
  pub fn get_type(&self) -> &str {
    &self.task_type
  }

  /// 获取任务负载
  /// Get task payload
  pub fn get_payload(&self) -> &[u8] {
    &self.payload
  }

  pub fn get_headers(&self) -> &HashMap<String, String> {
    &self.headers
  }

  /// 获取运行时元数据
  /// Get runtime metadata
  pub fn metadata(&self) -> Option<&TaskMetadata> {
    self.metadata.as_ref()
  }

  /// 从出队的消息重建任务，并附加运行时元数据
  /// Rebuild a task from a dequeued message and attach runtime metadata
  pub(crate) fn from_message(msg: &proto::TaskMessage) -> Result<Self> {
    let mut task = Self::new(&msg.r#type, &msg.payload)?;
    task.headers = msg.headers.clone();
    task.options = TaskOptions {
      task_id: Some(msg.id.clone()),
      queue: msg.queue.clone(),
      max_retry: msg.retry,
      timeout: (msg.timeout > 0).then(|| Duration::from_secs(msg.timeout as u64)),
      deadline: (msg.deadline > 0)
        .then(|| DateTime::from_timestamp(msg.deadline, 0))
        .flatten(),
      retention: (msg.retention > 0).then(|| Duration::from_secs(msg.retention as u64)),
    };
    task.metadata = Some(TaskMetadata {
      id: msg.id.clone(),
      queue: msg.queue.clone(),
      retried: msg.retried,
      max_retry: msg.retry,
    });
    Ok(task)
  }

  #[cfg(feature = "json")]
  /// 获取任务负载作为 JSON
  /// Get task payload as JSON
  pub fn get_payload_with_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
    serde_json::from_slice(&self.payload).map_err(Into::into)
  }
}

/// 任务信息，描述任务及其元数据
/// Task information, describing the task and its metadata
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
  pub id: String,
  pub queue: String,
  pub task_type: String,
  pub payload: Vec<u8>,
  pub state: TaskState,
  pub max_retry: i32,
  pub retried: i32,
  /// 上次失败的错误信息
  /// Error message from the last failure
  pub last_err: Option<String>,
  pub last_failed_at: Option<DateTime<Utc>>,
  pub timeout: Option<Duration>,
  pub deadline: Option<DateTime<Utc>>,
  pub retention: Option<Duration>,
  /// 下次处理时间
  /// Next processing time
  pub next_process_at: Option<DateTime<Utc>>,
}

impl TaskInfo {
  /// 从 Protocol Buffer 消息创建任务信息
  /// Create task information from Protocol Buffer message
  pub fn from_proto(
    msg: &proto::TaskMessage,
    state: TaskState,
    next_process_at: Option<DateTime<Utc>>,
  ) -> Self {
    Self {
      id: msg.id.clone(),
      queue: msg.queue.clone(),
      task_type: msg.r#type.clone(),
      payload: msg.payload.clone(),
      state,
      max_retry: msg.retry,
      retried: msg.retried,
      last_err: (!msg.error_msg.is_empty()).then(|| msg.error_msg.clone()),
      last_failed_at: (msg.last_failed_at != 0)
        .then(|| DateTime::from_timestamp(msg.last_failed_at, 0))
        .flatten(),
      timeout: (msg.timeout != 0).then(|| Duration::from_secs(msg.timeout as u64)),
      deadline: (msg.deadline != 0)
        .then(|| DateTime::from_timestamp(msg.deadline, 0))
        .flatten(),
      retention: (msg.retention != 0).then(|| Duration::from_secs(msg.retention as u64)),
      next_process_at,
    }
  }
}

/// 队列统计信息
/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
  pub name: String,
  pub pending: i64,
  pub active: i64,
  pub retry: i64,
  pub archived: i64,
  pub completed: i64,
}

impl QueueStats {
  /// 队列中尚未结束的任务数
  /// Number of tasks in the queue that have not finished
  pub fn in_flight(&self) -> i64 {
    self.pending + self.active + self.retry
  }
}
