//! 任务处理模块
//! Job processing module
//!
//! 端到端处理一个 `llm:process` 任务。每次尝试：读取记录，标记为处理中，调用模型，
//! 然后用一次更新写入报告或失败信息。写入成功后尝试回调，回调结果不影响任务。
//! Processes one `llm:process` job end to end. Per attempt: load the record, mark it
//! processing, ask the model, then write either the report or the failure in a single
//! update. A callback is attempted after a successful write and never affects the job.

use crate::callback::CallbackNotifier;
use crate::completion::{CompletionClient, CompletionError};
use crate::metrics::{self, MetricsTimer};
use crate::payload::LlmPayload;
use crate::store::{
  fields, validate_identifier, FieldValue, RecordStatus, RecordStore, StoreError,
  FIELD_CURRENT_TASK_NODE, FIELD_FAILED_INFO, FIELD_FAILED_TIMES, FIELD_REPORT, FIELD_STATUS,
};
use async_trait::async_trait;
use jobq::error::SkipRetryError;
use jobq::server::Handler;
use jobq::task::Task;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// 一次任务尝试的错误，带有步骤和记录上下文
/// Error of one job attempt, carrying step and record context
#[derive(Debug, Error)]
pub enum JobError {
  #[error("failed to unmarshal payload: {0}")]
  Payload(#[source] serde_json::Error),

  #[error("invalid payload: {0}")]
  InvalidPayload(#[source] StoreError),

  #[error("failed to get record: {0}")]
  Fetch(#[source] StoreError),

  #[error("failed to update status: {0}")]
  MarkProcessing(#[source] StoreError),

  #[error("failed to process LLM: {0}")]
  Completion(#[source] CompletionError),

  #[error("failed to update failure information: {source} (after: {cause})")]
  PersistFailure {
    #[source]
    source: StoreError,
    cause: CompletionError,
  },

  #[error("failed to update record: {0}")]
  PersistResult(#[source] StoreError),

  #[error("record {table}/{id} is already being processed by this worker")]
  RecordBusy { table: String, id: i64 },
}

impl JobError {
  /// 再次尝试是否可能成功
  /// Whether another attempt could succeed
  pub fn is_retryable(&self) -> bool {
    match self {
      JobError::Payload(_) | JobError::InvalidPayload(_) => false,
      JobError::Fetch(err) => !err.is_validation() && !matches!(err, StoreError::NotFound { .. }),
      JobError::MarkProcessing(err)
      | JobError::PersistResult(err)
      | JobError::PersistFailure { source: err, .. } => !err.is_validation(),
      JobError::Completion(_) | JobError::RecordBusy { .. } => true,
    }
  }

  /// 被打开的断路器拒绝，API 恢复期间属于预期情况
  /// Refused by the open breaker; expected while the API recovers
  pub fn is_circuit_open(&self) -> bool {
    match self {
      JobError::Completion(err) | JobError::PersistFailure { cause: err, .. } => {
        err.is_circuit_open()
      }
      _ => false,
    }
  }

  /// 任务计数指标中使用的状态标签
  /// Status label used by the task counter
  pub fn metric_label(&self) -> &'static str {
    match self {
      JobError::Payload(_) => "unmarshal_error",
      JobError::InvalidPayload(_) => "invalid_payload",
      JobError::Fetch(_) => "db_error",
      JobError::MarkProcessing(_) => "update_error",
      JobError::Completion(_) | JobError::PersistFailure { .. } => "llm_error",
      JobError::PersistResult(_) => "update_result_error",
      JobError::RecordBusy { .. } => "busy",
    }
  }
}

impl From<JobError> for jobq::error::Error {
  fn from(err: JobError) -> Self {
    if err.is_retryable() {
      jobq::error::Error::handler(err)
    } else {
      SkipRetryError::new(err).into()
    }
  }
}

/// 成功的尝试做了什么
/// What a successful attempt did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  Completed,
  /// 重复投递且记录已完成，没有写入任何内容
  /// A redelivered job whose record was already completed; nothing was written
  AlreadyCompleted,
}

impl Outcome {
  pub fn metric_label(&self) -> &'static str {
    match self {
      Outcome::Completed => "success",
      Outcome::AlreadyCompleted => "already_completed",
    }
  }
}

/// `llm:process` 任务处理器
/// `llm:process` task handler
///
/// 同一进程内同一条记录同时只会被一个尝试处理
/// Within one process a record is worked on by at most one attempt at a time
pub struct LlmTaskHandler {
  store: Arc<dyn RecordStore>,
  completion: Arc<CompletionClient>,
  callback: CallbackNotifier,
  in_flight: Arc<Mutex<HashSet<(String, i64)>>>,
}

impl LlmTaskHandler {
  pub fn new(
    store: Arc<dyn RecordStore>,
    completion: Arc<CompletionClient>,
    callback: CallbackNotifier,
  ) -> Self {
    Self {
      store,
      completion,
      callback,
      in_flight: Arc::new(Mutex::new(HashSet::new())),
    }
  }

  /// 为 `payload` 执行一次尝试
  /// Run one attempt for `payload`
  pub async fn process(&self, payload: &LlmPayload) -> Result<Outcome, JobError> {
    let table = payload.source_table.as_str();
    let id = payload.record_id;
    validate_identifier(table).map_err(JobError::InvalidPayload)?;
    let _claim = self.claim(table, id)?;

    let record = self.store.get(table, id).await.map_err(JobError::Fetch)?;
    if record.status == RecordStatus::Completed {
      tracing::info!(
        table = table,
        record_id = id,
        "record already completed, skipping"
      );
      return Ok(Outcome::AlreadyCompleted);
    }

    self
      .store
      .update_status(table, id, RecordStatus::Processing)
      .await
      .map_err(JobError::MarkProcessing)?;

    let report = match self
      .completion
      .complete(&record.sys_message, &record.user_message)
      .await
    {
      Ok(report) => report,
      Err(cause) => {
        let update = fields([
          (FIELD_STATUS, FieldValue::from(RecordStatus::Failed)),
          (FIELD_FAILED_TIMES, FieldValue::from(record.failed_times + 1)),
          (FIELD_FAILED_INFO, FieldValue::from(cause.to_string())),
        ]);
        if let Err(source) = self.store.update_fields(table, id, update).await {
          return Err(JobError::PersistFailure { source, cause });
        }
        return Err(JobError::Completion(cause));
      }
    };

    let update = fields([
      (FIELD_STATUS, FieldValue::from(RecordStatus::Completed)),
      (FIELD_REPORT, FieldValue::from(report.as_str())),
      (
        FIELD_CURRENT_TASK_NODE,
        FieldValue::from(record.current_task_node + 1),
      ),
    ]);
    self
      .store
      .update_fields(table, id, update)
      .await
      .map_err(JobError::PersistResult)?;

    if let Some(url) = record.callback_url() {
      match self.callback.deliver(url, &report).await {
        Ok(()) => tracing::debug!(table = table, record_id = id, "callback delivered"),
        Err(err) => tracing::warn!(
          table = table,
          record_id = id,
          callback_url = url,
          error = %err,
          "callback failed"
        ),
      }
    }

    Ok(Outcome::Completed)
  }

  fn claim(&self, table: &str, id: i64) -> Result<Claim, JobError> {
    let key = (table.to_string(), id);
    let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
    if !in_flight.insert(key.clone()) {
      return Err(JobError::RecordBusy {
        table: table.to_string(),
        id,
      });
    }
    Ok(Claim {
      in_flight: Arc::clone(&self.in_flight),
      key,
    })
  }
}

// Releases the record when the attempt ends, including on cancellation.
struct Claim {
  in_flight: Arc<Mutex<HashSet<(String, i64)>>>,
  key: (String, i64),
}

impl Drop for Claim {
  fn drop(&mut self) {
    self
      .in_flight
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(&self.key);
  }
}

#[async_trait]
impl Handler for LlmTaskHandler {
  async fn process_task(&self, task: Task) -> jobq::error::Result<()> {
    let timer = MetricsTimer::start();
    let (task_id, attempt) = task
      .metadata()
      .map(|m| (m.id.clone(), m.retried + 1))
      .unwrap_or_default();

    let payload = match LlmPayload::decode(task.get_payload()) {
      Ok(payload) => payload,
      Err(err) => {
        tracing::error!(task_id = %task_id, error = %err, "malformed llm payload");
        let err = JobError::Payload(err);
        metrics::record_task(task.get_type(), err.metric_label(), timer.elapsed());
        return Err(err.into());
      }
    };

    let result = self.process(&payload).await;
    let status = match &result {
      Ok(outcome) => outcome.metric_label(),
      Err(err) => err.metric_label(),
    };
    metrics::record_task(task.get_type(), status, timer.elapsed());

    match result {
      Ok(outcome) => {
        tracing::info!(
          table = %payload.source_table,
          record_id = payload.record_id,
          task_id = %task_id,
          attempt,
          "llm job finished: {:?}",
          outcome
        );
        Ok(())
      }
      Err(err) => {
        if err.is_circuit_open() {
          tracing::info!(
            table = %payload.source_table,
            record_id = payload.record_id,
            task_id = %task_id,
            attempt,
            "llm job deferred: {}",
            err
          );
        } else {
          tracing::warn!(
            table = %payload.source_table,
            record_id = payload.record_id,
            task_id = %task_id,
            attempt,
            retryable = err.is_retryable(),
            "llm job failed: {}",
            err
          );
        }
        Err(err.into())
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::breaker::{BreakerConfig, CircuitBreaker};
  use crate::completion::{http_client, CompletionConfig};
  use crate::store::{MemoryRecordStore, Record, StoreOp};
  use crate::url_guard::{StaticResolver, UrlGuard};
  use std::time::Duration;
  use wiremock::matchers::method;
  use wiremock::{Mock, MockServer, ResponseTemplate};

  const TABLE: &str = "valuation_records";

  fn handler(server_uri: &str, store: Arc<MemoryRecordStore>) -> LlmTaskHandler {
    let guard = UrlGuard::new().with_resolver(Arc::new(StaticResolver::new()));
    let http = http_client(Duration::from_secs(2)).unwrap();
    let completion = CompletionClient::with_http(
      http.clone(),
      CompletionConfig {
        base_url: server_uri.to_string(),
        api_key: "k".into(),
        model: "m".into(),
        max_tokens: 16,
        timeout: Duration::from_secs(2),
      },
      Arc::new(CircuitBreaker::new(BreakerConfig::default())),
    );
    LlmTaskHandler::new(
      store,
      Arc::new(completion),
      CallbackNotifier::new(http, guard),
    )
  }

  fn store_with(record: Record) -> Arc<MemoryRecordStore> {
    let store = Arc::new(MemoryRecordStore::new(
      UrlGuard::new().with_resolver(Arc::new(StaticResolver::new())),
    ));
    store.insert(TABLE, record);
    store
  }

  #[test]
  fn test_retry_classification() {
    let invalid = JobError::InvalidPayload(StoreError::InvalidIdentifier("a b".into()));
    assert!(!invalid.is_retryable());
    assert!(!JobError::Fetch(StoreError::NotFound {
      table: TABLE.into(),
      id: 1
    })
    .is_retryable());
    assert!(JobError::Fetch(StoreError::Database(sea_orm::DbErr::Custom("down".into())))
      .is_retryable());
    assert!(JobError::Completion(CompletionError::EmptyResponse).is_retryable());
    assert!(JobError::Completion(CompletionError::CircuitOpen).is_circuit_open());
    assert!(JobError::RecordBusy {
      table: TABLE.into(),
      id: 1
    }
    .is_retryable());
  }

  #[test]
  fn test_metric_labels() {
    let payload_err = serde_json::from_slice::<LlmPayload>(b"{").unwrap_err();
    let db = || StoreError::Database(sea_orm::DbErr::Custom("down".into()));
    let cases = [
      (JobError::Payload(payload_err), "unmarshal_error"),
      (JobError::Fetch(db()), "db_error"),
      (JobError::MarkProcessing(db()), "update_error"),
      (
        JobError::Completion(CompletionError::EmptyResponse),
        "llm_error",
      ),
      (
        JobError::PersistFailure {
          source: db(),
          cause: CompletionError::Timeout,
        },
        "llm_error",
      ),
      (JobError::PersistResult(db()), "update_result_error"),
    ];
    for (err, label) in cases {
      assert_eq!(err.metric_label(), label, "{err}");
    }
    assert_eq!(Outcome::Completed.metric_label(), "success");
    assert_eq!(Outcome::AlreadyCompleted.metric_label(), "already_completed");
  }

  #[test]
  fn test_each_attempt_is_counted_with_its_outcome() {
    use crate::metrics::testing::capture;
    use crate::metrics::{TASKS_TOTAL, TASK_DURATION_SECONDS};
    use crate::payload::TYPE_LLM;

    let ((), captured) = capture(async {
      let server = MockServer::start().await;
      Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
          "choices": [{"message": {"content": "report"}}]
        })))
        .mount(&server)
        .await;
      let handler = handler(&server.uri(), store_with(Record::new(1, "s", "u")));

      let job = br#"{"table_name":"valuation_records","id":1}"#;
      handler
        .process_task(Task::new(TYPE_LLM, job).unwrap())
        .await
        .unwrap();
      handler
        .process_task(Task::new(TYPE_LLM, job).unwrap())
        .await
        .unwrap();
      handler
        .process_task(Task::new(TYPE_LLM, b"[]").unwrap())
        .await
        .unwrap_err();
    });

    let count = |status: &str| captured.counter(TASKS_TOTAL, &[("type", TYPE_LLM), ("status", status)]);
    assert_eq!(count("success"), 1);
    assert_eq!(count("already_completed"), 1);
    assert_eq!(count("unmarshal_error"), 1);
    assert_eq!(
      captured.histogram_count(TASK_DURATION_SECONDS, &[("type", TYPE_LLM)]),
      3
    );
  }

  #[test]
  fn test_conversion_to_runtime_error() {
    let err: jobq::error::Error =
      JobError::InvalidPayload(StoreError::ReservedIdentifier("drop".into())).into();
    assert!(err.is_skip_retry());

    let err: jobq::error::Error = JobError::Completion(CompletionError::EmptyResponse).into();
    assert!(!err.is_skip_retry());
    assert!(err.is_retriable());
  }

  #[tokio::test]
  async fn test_already_completed_record_is_not_reprocessed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200))
      .expect(0)
      .mount(&server)
      .await;

    let mut record = Record::new(1, "s", "u");
    record.status = RecordStatus::Completed;
    record.report = Some("old".into());
    let store = store_with(record.clone());
    let handler = handler(&server.uri(), store.clone());

    let outcome = handler.process(&LlmPayload::new(TABLE, 1)).await.unwrap();
    assert_eq!(outcome, Outcome::AlreadyCompleted);
    assert_eq!(store.snapshot(TABLE, 1).unwrap(), record);
  }

  #[tokio::test]
  async fn test_fetch_failure_is_retryable_and_writes_nothing() {
    let server = MockServer::start().await;
    let store = store_with(Record::new(1, "s", "u"));
    store.fail_next(StoreOp::Get);
    let handler = handler(&server.uri(), store.clone());

    let err = handler
      .process(&LlmPayload::new(TABLE, 1))
      .await
      .unwrap_err();
    assert!(matches!(err, JobError::Fetch(_)));
    assert!(err.is_retryable());
    assert_eq!(store.snapshot(TABLE, 1).unwrap().status, RecordStatus::Pending);
  }

  #[tokio::test]
  async fn test_busy_record_is_rejected() {
    let server = MockServer::start().await;
    let store = store_with(Record::new(1, "s", "u"));
    let handler = handler(&server.uri(), store);

    let claim = handler.claim(TABLE, 1).unwrap();
    assert!(matches!(
      handler.process(&LlmPayload::new(TABLE, 1)).await,
      Err(JobError::RecordBusy { id: 1, .. })
    ));
    drop(claim);
    assert!(handler.claim(TABLE, 1).is_ok());
  }

  #[tokio::test]
  async fn test_malformed_payload_skips_retry() {
    let server = MockServer::start().await;
    let handler = handler(&server.uri(), store_with(Record::new(1, "s", "u")));
    let task = Task::new(crate::payload::TYPE_LLM, b"{not json").unwrap();
    let err = handler.process_task(task).await.unwrap_err();
    assert!(err.is_skip_retry());
  }

  #[tokio::test]
  async fn test_reserved_table_name_skips_retry() {
    let server = MockServer::start().await;
    let handler = handler(&server.uri(), store_with(Record::new(1, "s", "u")));
    let task = Task::new(
      crate::payload::TYPE_LLM,
      br#"{"table_name":"delete","id":1}"#,
    )
    .unwrap();
    let err = handler.process_task(task).await.unwrap_err();
    assert!(err.is_skip_retry());
  }
}
