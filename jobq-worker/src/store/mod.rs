//! 访问任务所指向的业务记录
//! Access to the business rows a job points at.
//!
//! 表名和字段名来自任务载荷，因此每个标识符在拼入 SQL 之前都要校验。
//! Table and field names come from job payloads, so every identifier is checked
//! against [`validate_identifier`] before it reaches a statement. Values are
//! always bound as parameters.

use crate::url_guard::{UrlGuard, UrlRejection};
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

pub mod memory;
pub mod sql;

pub use memory::{MemoryRecordStore, StoreCall, StoreOp};
pub use sql::SqlRecordStore;

pub const FIELD_STATUS: &str = "status";
pub const FIELD_REPORT: &str = "report";
pub const FIELD_FAILED_TIMES: &str = "failed_times";
pub const FIELD_FAILED_INFO: &str = "failed_info";
pub const FIELD_CURRENT_TASK_NODE: &str = "current_task_node";
pub const FIELD_CALLBACK_URL: &str = "callback_url";

const RESERVED_WORDS: &[&str] = &[
  "select", "from", "where", "insert", "update", "delete", "drop", "alter", "table", "and", "or",
  "not", "like", "in", "between", "is", "null", "true", "false",
];

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
  #[allow(clippy::unwrap_used)]
  Regex::new(r"^[A-Za-z0-9_]+$").unwrap()
});

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("invalid identifier: {0:?}")]
  InvalidIdentifier(String),

  #[error("identifier cannot be a reserved keyword: {0}")]
  ReservedIdentifier(String),

  #[error("invalid callback URL: {0}")]
  UnsafeCallbackUrl(#[from] UrlRejection),

  #[error("update has no fields")]
  EmptyUpdate,

  #[error("record {id} not found in {table}")]
  NotFound { table: String, id: i64 },

  #[error("database error: {0}")]
  Database(#[from] sea_orm::DbErr),
}

impl StoreError {
  /// 在访问数据库之前被拒绝，重试无济于事
  /// Rejected before touching the database; retrying cannot help.
  pub fn is_validation(&self) -> bool {
    matches!(
      self,
      StoreError::InvalidIdentifier(_)
        | StoreError::ReservedIdentifier(_)
        | StoreError::UnsafeCallbackUrl(_)
        | StoreError::EmptyUpdate
    )
  }
}

/// 接受匹配 `^[A-Za-z0-9_]+$` 且不是保留字的名称，不区分大小写
/// Accepts `^[A-Za-z0-9_]+$` names that are not reserved words, in any case.
pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
  if !IDENTIFIER.is_match(name) {
    return Err(StoreError::InvalidIdentifier(name.to_string()));
  }
  if RESERVED_WORDS
    .iter()
    .any(|word| word.eq_ignore_ascii_case(name))
  {
    return Err(StoreError::ReservedIdentifier(name.to_string()));
  }
  Ok(())
}

/// 本工作者视角下记录的生命周期
/// Lifecycle of a record as this worker sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordStatus {
  Pending,
  Processing,
  Completed,
  Failed,
}

impl RecordStatus {
  /// 写入 `status` 列的值
  /// The value persisted in the `status` column.
  pub fn label(&self) -> &'static str {
    match self {
      RecordStatus::Pending => "待处理",
      RecordStatus::Processing => "处理中",
      RecordStatus::Completed => "已完成",
      RecordStatus::Failed => "失败",
    }
  }

  /// 解析已存储的标签；未知值或空值视为 pending
  /// Reads a stored label. Unknown or empty values count as pending.
  pub fn from_label(label: &str) -> Self {
    match label.trim() {
      "处理中" => RecordStatus::Processing,
      "已完成" => RecordStatus::Completed,
      "失败" => RecordStatus::Failed,
      other if other.eq_ignore_ascii_case("processing") => RecordStatus::Processing,
      other if other.eq_ignore_ascii_case("completed") => RecordStatus::Completed,
      other if other.eq_ignore_ascii_case("failed") => RecordStatus::Failed,
      _ => RecordStatus::Pending,
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, RecordStatus::Completed | RecordStatus::Failed)
  }
}

impl fmt::Display for RecordStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.label())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
  pub id: i64,
  pub status: RecordStatus,
  pub user_message: String,
  pub sys_message: String,
  pub report: Option<String>,
  pub failed_times: i64,
  pub failed_info: Option<String>,
  pub progress: Option<String>,
  pub progress_info: Option<String>,
  pub current_task_node: i64,
  pub callback_url: Option<String>,
}

impl Record {
  pub fn new(id: i64, sys_message: &str, user_message: &str) -> Self {
    Self {
      id,
      status: RecordStatus::Pending,
      user_message: user_message.to_string(),
      sys_message: sys_message.to_string(),
      report: None,
      failed_times: 0,
      failed_info: None,
      progress: None,
      progress_info: None,
      current_task_node: 0,
      callback_url: None,
    }
  }

  /// 回调地址，仅在已设置且非空白时返回
  /// The callback URL, if one is set and non-blank.
  pub fn callback_url(&self) -> Option<&str> {
    self
      .callback_url
      .as_deref()
      .map(str::trim)
      .filter(|url| !url.is_empty())
  }
}

/// 绑定到更新语句中的值
/// A value bound into an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
  Text(String),
  Int(i64),
  Null,
}

impl From<&str> for FieldValue {
  fn from(value: &str) -> Self {
    FieldValue::Text(value.to_string())
  }
}

impl From<String> for FieldValue {
  fn from(value: String) -> Self {
    FieldValue::Text(value)
  }
}

impl From<i64> for FieldValue {
  fn from(value: i64) -> Self {
    FieldValue::Int(value)
  }
}

impl From<RecordStatus> for FieldValue {
  fn from(status: RecordStatus) -> Self {
    FieldValue::Text(status.label().to_string())
  }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
  fn from(value: Option<T>) -> Self {
    value.map_or(FieldValue::Null, Into::into)
  }
}

/// 列名到新值的映射，在一条语句中应用
/// Column name to new value, applied in one statement.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// 由 `(name, value)` 对构建 [`FieldMap`]
/// Build a [`FieldMap`] from `(name, value)` pairs.
pub fn fields<I, K, V>(pairs: I) -> FieldMap
where
  I: IntoIterator<Item = (K, V)>,
  K: Into<String>,
  V: Into<FieldValue>,
{
  pairs
    .into_iter()
    .map(|(k, v)| (k.into(), v.into()))
    .collect()
}

/// 在写入任何内容之前校验整个更新
/// Check a whole update before anything is written.
pub(crate) async fn check_update(
  guard: &UrlGuard,
  table: &str,
  fields: &FieldMap,
) -> Result<(), StoreError> {
  validate_identifier(table)?;
  if fields.is_empty() {
    return Err(StoreError::EmptyUpdate);
  }
  for (name, value) in fields {
    validate_identifier(name)?;
    if name == FIELD_CALLBACK_URL {
      if let FieldValue::Text(url) = value {
        if !url.is_empty() {
          guard.validate(url).await?;
        }
      }
    }
  }
  Ok(())
}

/// 任务处理器需要的存储操作
/// Operations the job processor needs from the backing store.
#[async_trait]
pub trait RecordStore: Send + Sync {
  async fn get(&self, table: &str, id: i64) -> Result<Record, StoreError>;

  async fn update_status(&self, table: &str, id: i64, status: RecordStatus)
    -> Result<(), StoreError>;

  async fn update_failure(
    &self,
    table: &str,
    id: i64,
    error_text: &str,
    failed_times: i64,
  ) -> Result<(), StoreError>;

  /// 在一条语句中设置全部字段；`callback_url` 必须通过 URL 校验
  /// Set every field in one statement. A `callback_url` must pass the URL guard.
  async fn update_fields(&self, table: &str, id: i64, fields: FieldMap) -> Result<(), StoreError>;

  async fn ping(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[test]
  fn test_validate_identifier() {
    for ok in ["valuation_records", "status", "T1", "_x", "a_b_c_123", "orders"] {
      assert!(validate_identifier(ok).is_ok(), "{ok}");
    }
    for bad in [
      "",
      "valuation records",
      "records;drop",
      "a-b",
      "t.name",
      "`status`",
      "name'--",
      "表",
    ] {
      assert!(
        matches!(validate_identifier(bad), Err(StoreError::InvalidIdentifier(_))),
        "{bad}"
      );
    }
  }

  #[test]
  fn test_reserved_words_rejected_in_any_case() {
    for word in RESERVED_WORDS {
      let variants = [
        word.to_string(),
        word.to_uppercase(),
        word
          .chars()
          .enumerate()
          .map(|(i, c)| if i % 2 == 0 { c.to_ascii_uppercase() } else { c })
          .collect(),
      ];
      for variant in variants {
        assert!(
          matches!(
            validate_identifier(&variant),
            Err(StoreError::ReservedIdentifier(_))
          ),
          "{variant}"
        );
      }
    }
    assert!(validate_identifier("selected").is_ok());
    assert!(validate_identifier("is_active").is_ok());
  }

  #[test]
  fn test_status_labels() {
    for status in [
      RecordStatus::Pending,
      RecordStatus::Processing,
      RecordStatus::Completed,
      RecordStatus::Failed,
    ] {
      assert_eq!(RecordStatus::from_label(status.label()), status);
    }
    assert_eq!(RecordStatus::from_label("COMPLETED"), RecordStatus::Completed);
    assert_eq!(RecordStatus::from_label(""), RecordStatus::Pending);
    assert_eq!(RecordStatus::from_label("whatever"), RecordStatus::Pending);
    assert!(RecordStatus::Failed.is_terminal());
    assert!(!RecordStatus::Processing.is_terminal());
  }

  #[test]
  fn test_field_values() {
    let map = fields([
      (FIELD_STATUS, FieldValue::from(RecordStatus::Completed)),
      (FIELD_FAILED_TIMES, FieldValue::from(3_i64)),
      (FIELD_CALLBACK_URL, FieldValue::from(None::<String>)),
    ]);
    assert_eq!(map[FIELD_STATUS], FieldValue::Text("已完成".into()));
    assert_eq!(map[FIELD_FAILED_TIMES], FieldValue::Int(3));
    assert_eq!(map[FIELD_CALLBACK_URL], FieldValue::Null);
  }

  #[test]
  fn test_callback_url_accessor() {
    let mut record = Record::new(1, "sys", "user");
    assert_eq!(record.callback_url(), None);
    record.callback_url = Some("   ".into());
    assert_eq!(record.callback_url(), None);
    record.callback_url = Some("https://example.com/hook".into());
    assert_eq!(record.callback_url(), Some("https://example.com/hook"));
  }

  #[tokio::test]
  async fn test_check_update() {
    let guard = UrlGuard::new().with_resolver(Arc::new(crate::url_guard::StaticResolver::new()));

    let ok = fields([(FIELD_REPORT, "done")]);
    assert!(check_update(&guard, "valuation_records", &ok).await.is_ok());

    assert!(matches!(
      check_update(&guard, "valuation_records", &FieldMap::new()).await,
      Err(StoreError::EmptyUpdate)
    ));

    let bad_field = fields([("status = 1, report", "x")]);
    assert!(matches!(
      check_update(&guard, "valuation_records", &bad_field).await,
      Err(StoreError::InvalidIdentifier(_))
    ));

    let bad_url = fields([
      (FIELD_REPORT, "done"),
      (FIELD_CALLBACK_URL, "http://169.254.169.254/"),
    ]);
    let err = check_update(&guard, "valuation_records", &bad_url)
      .await
      .unwrap_err();
    assert!(matches!(err, StoreError::UnsafeCallbackUrl(_)));
    assert!(err.is_validation());

    let cleared = fields([(FIELD_CALLBACK_URL, "")]);
    assert!(check_update(&guard, "valuation_records", &cleared).await.is_ok());
  }
}
