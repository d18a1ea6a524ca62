//! 指标模块
//! Metrics module
//!
//! 通过 `metrics` 门面记录任务、LLM 调用、数据库查询、回调、队列和断路器的指标。
//! 导出器由嵌入进程安装；未安装时所有记录都是空操作。
//! Records task, LLM call, database query, callback, queue and breaker metrics through
//! the `metrics` facade. The embedding process installs an exporter; without one every
//! call is a no-op.

use crate::breaker::BreakerState;
use jobq::task::QueueStats;
use std::time::{Duration, Instant};

pub const TASKS_TOTAL: &str = "jobq_tasks_total";
pub const TASK_DURATION_SECONDS: &str = "jobq_task_duration_seconds";
pub const LLM_API_CALLS_TOTAL: &str = "jobq_llm_api_calls_total";
pub const LLM_API_DURATION_SECONDS: &str = "jobq_llm_api_duration_seconds";
pub const DATABASE_QUERIES_TOTAL: &str = "jobq_database_queries_total";
pub const DATABASE_QUERY_DURATION_SECONDS: &str = "jobq_database_query_duration_seconds";
pub const CALLBACKS_TOTAL: &str = "jobq_callbacks_total";
pub const WORKERS: &str = "jobq_workers";
pub const QUEUE_SIZE: &str = "jobq_queue_size";
pub const BREAKER_TRANSITIONS_TOTAL: &str = "jobq_circuit_breaker_transitions_total";
pub const BREAKER_STATE: &str = "jobq_circuit_breaker_state";

/// 记录一次任务尝试的结果和耗时
/// Record the outcome and duration of one task attempt
pub fn record_task(task_type: &str, status: &'static str, elapsed: Duration) {
  ::metrics::counter!(TASKS_TOTAL, "type" => task_type.to_string(), "status" => status)
    .increment(1);
  ::metrics::histogram!(TASK_DURATION_SECONDS, "type" => task_type.to_string())
    .record(elapsed.as_secs_f64());
}

/// 记录一次 LLM API 调用
/// Record one LLM API call
pub fn record_llm_call(status: &'static str, elapsed: Duration) {
  ::metrics::counter!(LLM_API_CALLS_TOTAL, "status" => status).increment(1);
  ::metrics::histogram!(LLM_API_DURATION_SECONDS).record(elapsed.as_secs_f64());
}

/// 记录一次数据库查询
/// Record one database query
pub fn record_db_query(operation: &'static str, status: &'static str, elapsed: Duration) {
  ::metrics::counter!(DATABASE_QUERIES_TOTAL, "operation" => operation, "status" => status)
    .increment(1);
  ::metrics::histogram!(DATABASE_QUERY_DURATION_SECONDS, "operation" => operation)
    .record(elapsed.as_secs_f64());
}

pub fn record_callback(status: &'static str) {
  ::metrics::counter!(CALLBACKS_TOTAL, "status" => status).increment(1);
}

/// 设置工作者数量
/// Set the number of workers
pub fn set_workers(count: usize) {
  ::metrics::gauge!(WORKERS).set(count as f64);
}

/// 按状态发布队列长度
/// Publish queue sizes by state
pub fn set_queue_size(stats: &QueueStats) {
  let states = [
    ("pending", stats.pending),
    ("active", stats.active),
    ("retry", stats.retry),
    ("archived", stats.archived),
  ];
  for (state, size) in states {
    ::metrics::gauge!(QUEUE_SIZE, "queue" => stats.name.clone(), "state" => state)
      .set(size as f64);
  }
}

/// 记录断路器状态变化
/// Record a circuit breaker state change
pub fn record_breaker_transition(name: &str, from: BreakerState, to: BreakerState) {
  ::metrics::counter!(
    BREAKER_TRANSITIONS_TOTAL,
    "name" => name.to_string(),
    "from" => state_label(from),
    "to" => state_label(to)
  )
  .increment(1);
  ::metrics::gauge!(BREAKER_STATE, "name" => name.to_string()).set(state_value(to));
}

fn state_label(state: BreakerState) -> &'static str {
  match state {
    BreakerState::Closed => "closed",
    BreakerState::HalfOpen => "half_open",
    BreakerState::Open => "open",
  }
}

fn state_value(state: BreakerState) -> f64 {
  match state {
    BreakerState::Closed => 0.0,
    BreakerState::HalfOpen => 1.0,
    BreakerState::Open => 2.0,
  }
}

/// 计时器：从创建开始计时
/// Timer: measures from its creation
#[derive(Debug, Clone, Copy)]
pub struct MetricsTimer {
  start: Instant,
}

impl MetricsTimer {
  pub fn start() -> Self {
    Self {
      start: Instant::now(),
    }
  }

  pub fn elapsed(&self) -> Duration {
    self.start.elapsed()
  }
}
