//! 错误处理模块
//! Error handling module
//!
//! 定义了任务运行时使用的错误类型
//! Defines the error types used by the job runtime

use thiserror::Error;

/// 运行时的结果类型
/// Result type for the runtime
pub type Result<T> = std::result::Result<T, Error>;

/// 运行时错误类型
/// Runtime error type
#[derive(Error, Debug)]
pub enum Error {
  /// Redis connection error
  #[error("Redis connection error: {0}")]
  Redis(#[from] redis::RedisError),

  #[cfg(feature = "json")]
  /// 序列化错误
  /// Serialization error
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// Protocol Buffer 编码错误
  /// Protocol buffer encoding error
  #[error("Protocol buffer encoding error: {0}")]
  ProtoEncode(#[from] prost::EncodeError),

  /// Protocol Buffer 解码错误
  /// Protocol buffer decoding error
  #[error("Protocol buffer decoding error: {0}")]
  ProtoDecode(#[from] prost::DecodeError),

  /// 任务 ID 冲突错误
  /// Task ID conflict error
  #[error("Task ID conflicts with another task")]
  TaskIdConflict,

  /// 任务未找到错误
  /// Task not found error
  #[error("Task not found: {id}")]
  TaskNotFound { id: String },

  /// 无效的队列名称
  /// Invalid queue name
  #[error("Invalid queue name: {name}")]
  InvalidQueueName { name: String },

  /// 无效的任务类型
  /// Invalid task type
  #[error("Invalid task type: {task_type}")]
  InvalidTaskType { task_type: String },

  /// 没有处理器匹配任务类型
  /// No handler matches the task type
  #[error("No handler registered for task type: {task_type}")]
  HandlerNotFound { task_type: String },

  /// 服务器已在运行
  /// Server is already running
  #[error("Server is already running")]
  ServerRunning,

  /// 超时错误
  /// Timeout error
  #[error("Operation timeout")]
  Timeout,

  /// 取消错误
  /// Cancellation error
  #[error("Operation cancelled")]
  Cancelled,

  /// 配置错误
  /// Configuration error
  #[error("Configuration error: {message}")]
  Config { message: String },

  /// 处理器返回的错误，任务会按策略重试
  /// Error returned by a handler, the task is retried per policy
  #[error("Handler error: {0}")]
  Handler(Box<dyn std::error::Error + Send + Sync>),

  /// 处理器要求跳过重试，任务直接归档
  /// Handler asked to skip retries, the task is archived directly
  #[error(transparent)]
  SkipRetry(#[from] SkipRetryError),

  /// 其他错误
  /// Other error
  #[error("Other error: {message}")]
  Other { message: String },
}

impl Error {
  /// 创建配置错误
  /// Create a configuration error
  pub fn config<S: Into<String>>(message: S) -> Self {
    Self::Config {
      message: message.into(),
    }
  }

  /// 创建其他错误
  /// Create another type of error
  pub fn other<S: Into<String>>(message: S) -> Self {
    Self::Other {
      message: message.into(),
    }
  }

  /// 包装处理器错误
  /// Wrap a handler error
  pub fn handler<E>(error: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Handler(Box::new(error))
  }

  /// 检查是否为重试错误
  /// Check if the error is retriable
  pub fn is_retriable(&self) -> bool {
    match self {
      Error::Redis(_) | Error::Timeout | Error::Handler(_) => true,
      Error::ProtoEncode(_)
      | Error::ProtoDecode(_)
      | Error::TaskIdConflict
      | Error::TaskNotFound { .. }
      | Error::InvalidQueueName { .. }
      | Error::InvalidTaskType { .. }
      | Error::HandlerNotFound { .. }
      | Error::ServerRunning
      | Error::Cancelled
      | Error::Config { .. }
      | Error::SkipRetry(_)
      | Error::Other { .. } => false,
      #[cfg(feature = "json")]
      Error::Serialization(_) => false,
    }
  }

  /// 检查是否为致命错误
  /// Check if the error is fatal
  pub fn is_fatal(&self) -> bool {
    !self.is_retriable()
  }

  /// 是否应跳过剩余重试
  /// Whether remaining retries should be skipped
  pub fn is_skip_retry(&self) -> bool {
    matches!(self, Error::SkipRetry(_))
  }
}

/// 特殊的跳过重试错误包装器
/// Special skip retry error wrapper
#[derive(Error, Debug)]
#[error("Skip retry: {0}")]
pub struct SkipRetryError(pub Box<dyn std::error::Error + Send + Sync>);

impl SkipRetryError {
  /// 创建新的跳过重试错误
  /// Create a new skip retry error
  pub fn new<E>(error: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self(Box::new(error))
  }
}
