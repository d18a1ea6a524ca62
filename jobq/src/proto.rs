//! Protocol Buffer 消息定义
//! Protocol Buffer message definitions
//!
//! 字段编号与 Go asynq 的 `TaskMessage` 保持一致，便于与 Go 生产者互通
//! Field tags match Go asynq's `TaskMessage` so Go producers interoperate

use std::collections::HashMap;

/// 任务消息
/// Task message
#[derive(Clone, PartialEq, prost::Message)]
pub struct TaskMessage {
  /// 任务类型
  /// Task type
  #[prost(string, tag = "1")]
  pub r#type: String,
  /// 任务负载
  /// Task payload
  #[prost(bytes = "vec", tag = "2")]
  pub payload: Vec<u8>,
  /// 任务 ID
  /// Task ID
  #[prost(string, tag = "3")]
  pub id: String,
  /// 队列名称
  /// Queue name
  #[prost(string, tag = "4")]
  pub queue: String,
  /// 最大重试次数
  /// Maximum retry count
  #[prost(int32, tag = "5")]
  pub retry: i32,
  /// 已重试次数
  /// Number of retries so far
  #[prost(int32, tag = "6")]
  pub retried: i32,
  /// 上次失败的错误信息
  /// Error message of the last failure
  #[prost(string, tag = "7")]
  pub error_msg: String,
  /// 超时秒数
  /// Timeout in seconds
  #[prost(int64, tag = "8")]
  pub timeout: i64,
  /// 截止时间（Unix 秒）
  /// Deadline (Unix seconds)
  #[prost(int64, tag = "9")]
  pub deadline: i64,
  #[prost(string, tag = "10")]
  pub unique_key: String,
  /// 上次失败时间（Unix 秒）
  /// Last failure time (Unix seconds)
  #[prost(int64, tag = "11")]
  pub last_failed_at: i64,
  #[prost(string, tag = "14")]
  pub group_key: String,
  /// 完成后保留秒数
  /// Retention after completion, in seconds
  #[prost(int64, tag = "15")]
  pub retention: i64,
  /// 完成时间（Unix 秒）
  /// Completion time (Unix seconds)
  #[prost(int64, tag = "16")]
  pub completed_at: i64,
  #[prost(map = "string, string", tag = "17")]
  pub headers: HashMap<String, String>,
}
