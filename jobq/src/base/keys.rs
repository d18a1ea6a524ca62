//! Redis 键名 - 与 Go asynq 的键布局保持兼容
//! Redis key names - compatible with the Go asynq key layout

use crate::base::constants::TIME_LAYOUT_YMD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// 所有队列名称的集合
/// Set of all queue names
pub const ALL_QUEUES: &str = "asynq:queues";

/// 任务状态
/// Task state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
  /// 任务正在被处理
  /// Task is being processed
  Active,
  /// 任务准备好被处理
  /// Task is ready to be processed
  Pending,
  /// 任务之前失败了，安排在将来某个时间重试
  /// Task has failed before, scheduled to retry at a later time
  Retry,
  /// 任务被归档并存储以供检查
  /// Task is archived and stored for inspection
  Archived,
  /// 任务处理成功并保留到保留 TTL 过期
  /// Task is successfully processed and retained until retention TTL expires
  Completed,
}

impl TaskState {
  /// 将任务状态转换为字符串
  /// Convert task state to string
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Active => "active",
      Self::Pending => "pending",
      Self::Retry => "retry",
      Self::Archived => "archived",
      Self::Completed => "completed",
    }
  }

  /// 该状态在队列中的键
  /// Key of this state within a queue
  pub fn queue_key(&self, qname: &str) -> String {
    format!("{}{}", queue_key_prefix(qname), self.as_str())
  }
}

impl FromStr for TaskState {
  type Err = ();

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "active" => Ok(Self::Active),
      "pending" => Ok(Self::Pending),
      "retry" => Ok(Self::Retry),
      "archived" => Ok(Self::Archived),
      "completed" => Ok(Self::Completed),
      _ => Err(()),
    }
  }
}

impl std::fmt::Display for TaskState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// 生成队列键前缀 - 与 Go 版本兼容: asynq:{qname}:
/// Generate queue key prefix - compatible with Go version: asynq:{qname}:
pub fn queue_key_prefix(qname: &str) -> String {
  format!("asynq:{{{}}}:", qname)
}

/// 生成任务键: asynq:{qname}:t:<id>
/// Generate task key: asynq:{qname}:t:<id>
pub fn task_key(qname: &str, id: &str) -> String {
  format!("{}t:{}", queue_key_prefix(qname), id)
}

pub fn pending_key(qname: &str) -> String {
  TaskState::Pending.queue_key(qname)
}

pub fn active_key(qname: &str) -> String {
  TaskState::Active.queue_key(qname)
}

pub fn retry_key(qname: &str) -> String {
  TaskState::Retry.queue_key(qname)
}

pub fn archived_key(qname: &str) -> String {
  TaskState::Archived.queue_key(qname)
}

pub fn completed_key(qname: &str) -> String {
  TaskState::Completed.queue_key(qname)
}

/// 活跃任务租约集合
/// Sorted set of active task leases
pub fn lease_key(qname: &str) -> String {
  format!("{}lease", queue_key_prefix(qname))
}

/// 存在即表示队列暂停
/// Queue is paused while this key exists
pub fn paused_key(qname: &str) -> String {
  format!("{}paused", queue_key_prefix(qname))
}

/// 按天统计的处理数
/// Processed count for a day
pub fn processed_key(qname: &str, date: &DateTime<Utc>) -> String {
  format!(
    "{}processed:{}",
    queue_key_prefix(qname),
    date.format(TIME_LAYOUT_YMD)
  )
}

/// 按天统计的失败数
/// Failed count for a day
pub fn failed_key(qname: &str, date: &DateTime<Utc>) -> String {
  format!(
    "{}failed:{}",
    queue_key_prefix(qname),
    date.format(TIME_LAYOUT_YMD)
  )
}

pub fn processed_total_key(qname: &str) -> String {
  format!("{}processed", queue_key_prefix(qname))
}

pub fn failed_total_key(qname: &str) -> String {
  format!("{}failed", queue_key_prefix(qname))
}
