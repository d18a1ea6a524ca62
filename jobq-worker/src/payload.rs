//! 任务载荷模块
//! Payload module
//!
//! `llm:process` 任务的线上格式与生产者
//! The `llm:process` job: wire format and producer side

use crate::settings::QueueSettings;
use crate::store::{validate_identifier, StoreError};
use jobq::client::Client;
use jobq::task::{Task, TaskInfo};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const TYPE_LLM: &str = "llm:process";

/// 让任务指向一条记录，字段名与现有生产者写入的一致
/// Points a job at one record. Field names match what existing producers write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmPayload {
  #[serde(rename = "table_name", alias = "source_table")]
  pub source_table: String,
  #[serde(rename = "id", alias = "record_id")]
  pub record_id: i64,
}

impl LlmPayload {
  pub fn new<S: Into<String>>(source_table: S, record_id: i64) -> Self {
    Self {
      source_table: source_table.into(),
      record_id,
    }
  }

  pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
    serde_json::from_slice(bytes)
  }
}

/// 入队错误
/// Enqueue error
#[derive(Debug, Error)]
pub enum ProduceError {
  #[error(transparent)]
  InvalidTable(#[from] StoreError),

  #[error(transparent)]
  Queue(#[from] jobq::error::Error),
}

/// 校验表名后创建 `llm:process` 任务
/// Build an `llm:process` task after checking the table name
pub fn new_llm_task(table: &str, id: i64) -> Result<Task, ProduceError> {
  validate_identifier(table)?;
  Ok(Task::new_with_json(TYPE_LLM, &LlmPayload::new(table, id))?)
}

/// 按配置的重试次数和保留期入队 `llm:process` 任务
/// Enqueues `llm:process` jobs with the configured retry and retention
pub struct LlmTaskProducer {
  client: Client,
  max_retry: i32,
  retention: Option<Duration>,
}

impl LlmTaskProducer {
  pub fn new(client: Client) -> Self {
    Self {
      client,
      max_retry: jobq::base::constants::DEFAULT_MAX_RETRY,
      retention: None,
    }
  }

  /// 使用 `queue.retry` 和 `queue.retention_secs` 创建生产者
  /// Create a producer that applies `queue.retry` and `queue.retention_secs`
  pub fn from_settings(client: Client, queue: &QueueSettings) -> Self {
    Self::new(client)
      .max_retry(queue.retry)
      .retention(Duration::from_secs(queue.retention_secs))
  }

  pub fn max_retry(mut self, max_retry: i32) -> Self {
    self.max_retry = max_retry;
    self
  }

  pub fn retention(mut self, retention: Duration) -> Self {
    self.retention = Some(retention);
    self
  }

  pub async fn enqueue(&self, table: &str, id: i64) -> Result<TaskInfo, ProduceError> {
    let mut task = new_llm_task(table, id)?.with_max_retry(self.max_retry);
    if let Some(retention) = self.retention {
      task = task.with_retention(retention);
    }
    let info = self.client.enqueue(task).await?;
    tracing::info!(
      table = table,
      record_id = id,
      task_id = %info.id,
      "enqueued {}",
      TYPE_LLM
    );
    Ok(info)
  }
}
