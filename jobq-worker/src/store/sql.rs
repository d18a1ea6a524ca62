//! SQL 记录存储
//! SQL record store
//!
//! 通过 sea-orm 访问关系数据库的 [`RecordStore`]。记录位于调用方指定的表中，
//! 因此语句手工拼接：表名和列名都是校验过的标识符，所有值都绑定为参数。
//! [`RecordStore`] over a relational database through sea-orm. Records live in
//! caller-named tables, so statements are built by hand: the table and column
//! names are validated identifiers, every value is bound.

use super::{
  check_update, validate_identifier, FieldMap, FieldValue, Record, RecordStatus, RecordStore,
  StoreError, FIELD_FAILED_INFO, FIELD_FAILED_TIMES, FIELD_STATUS,
};
use crate::metrics::{self, MetricsTimer};
use crate::url_guard::UrlGuard;
use async_trait::async_trait;
use sea_orm::{
  ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, QueryResult,
  Statement, Value,
};
use std::future::Future;
use std::time::Duration;

const OP_GET_RECORD: &str = "get_record";
const OP_UPDATE_STATUS: &str = "update_status";
const OP_UPDATE_FAILURE: &str = "update_failure";
const OP_UPDATE_RECORD: &str = "update_record";

const RECORD_COLUMNS: &str = "id, status, user_message, sys_message, report, failed_times, \
  failed_info, progress, progress_info, current_task_node, callback_url";

pub struct SqlRecordStore {
  db: DatabaseConnection,
  guard: UrlGuard,
}

impl SqlRecordStore {
  /// 连接 `database_url`（`mysql://`、`postgres://` 或 `sqlite:`）并创建连接池
  /// Open a pool against `database_url` (`mysql://`, `postgres://` or `sqlite:`)
  pub async fn connect(
    database_url: &str,
    max_connections: u32,
    guard: UrlGuard,
  ) -> Result<Self, StoreError> {
    let opt = ConnectOptions::new(database_url)
      .max_connections(max_connections)
      .connect_timeout(Duration::from_secs(10))
      .sqlx_logging(false)
      .to_owned();
    let db = Database::connect(opt).await?;
    Ok(Self::from_connection(db, guard))
  }

  pub fn from_connection(db: DatabaseConnection, guard: UrlGuard) -> Self {
    Self { db, guard }
  }

  pub fn db(&self) -> &DatabaseConnection {
    &self.db
  }

  fn backend(&self) -> DatabaseBackend {
    self.db.get_database_backend()
  }

  /// 对已校验的名称执行 `UPDATE table SET .. WHERE id = ..`
  /// Run `UPDATE table SET .. WHERE id = ..` for already validated names
  async fn apply(
    &self,
    table: &str,
    id: i64,
    assignments: Vec<(&str, Value)>,
  ) -> Result<(), StoreError> {
    let backend = self.backend();
    let mut values = Vec::with_capacity(assignments.len() + 1);
    let mut sets = Vec::with_capacity(assignments.len());
    for (column, value) in assignments {
      values.push(value);
      sets.push(format!(
        "{} = {}",
        quote(backend, column),
        placeholder(backend, values.len())
      ));
    }
    values.push(id.into());
    let sql = format!(
      "UPDATE {} SET {} WHERE id = {}",
      quote(backend, table),
      sets.join(", "),
      placeholder(backend, values.len())
    );
    tracing::debug!("update {} id={} columns={}", table, id, sets.len());
    // Affected rows are not checked: MySQL reports zero when values are unchanged.
    let _ = self
      .db
      .execute(Statement::from_sql_and_values(backend, sql, values))
      .await?;
    Ok(())
  }
}

#[async_trait]
impl RecordStore for SqlRecordStore {
  async fn get(&self, table: &str, id: i64) -> Result<Record, StoreError> {
    observed(OP_GET_RECORD, async {
      validate_identifier(table)?;
      let backend = self.backend();
      let sql = format!(
        "SELECT {} FROM {} WHERE id = {}",
        RECORD_COLUMNS,
        quote(backend, table),
        placeholder(backend, 1)
      );
      let row = self
        .db
        .query_one(Statement::from_sql_and_values(backend, sql, [id.into()]))
        .await?
        .ok_or_else(|| StoreError::NotFound {
          table: table.to_string(),
          id,
        })?;
      decode_record(&row)
    })
    .await
  }

  async fn update_status(
    &self,
    table: &str,
    id: i64,
    status: RecordStatus,
  ) -> Result<(), StoreError> {
    observed(OP_UPDATE_STATUS, async {
      validate_identifier(table)?;
      self
        .apply(table, id, vec![(FIELD_STATUS, status.label().into())])
        .await
    })
    .await
  }

  async fn update_failure(
    &self,
    table: &str,
    id: i64,
    error_text: &str,
    failed_times: i64,
  ) -> Result<(), StoreError> {
    observed(OP_UPDATE_FAILURE, async {
      validate_identifier(table)?;
      self
        .apply(
          table,
          id,
          vec![
            (FIELD_FAILED_INFO, error_text.into()),
            (FIELD_FAILED_TIMES, failed_times.into()),
          ],
        )
        .await
    })
    .await
  }

  async fn update_fields(&self, table: &str, id: i64, fields: FieldMap) -> Result<(), StoreError> {
    observed(OP_UPDATE_RECORD, async {
      check_update(&self.guard, table, &fields).await?;
      let assignments = fields
        .iter()
        .map(|(name, value)| (name.as_str(), bind(value)))
        .collect();
      self.apply(table, id, assignments).await
    })
    .await
  }

  async fn ping(&self) -> Result<(), StoreError> {
    self.db.ping().await?;
    Ok(())
  }
}

/// 执行一次查询并记录其结果与耗时
/// Run one query and record its outcome and duration
async fn observed<T, F>(operation: &'static str, query: F) -> Result<T, StoreError>
where
  F: Future<Output = Result<T, StoreError>>,
{
  let timer = MetricsTimer::start();
  let result = query.await;
  metrics::record_db_query(operation, query_status(&result), timer.elapsed());
  result
}

fn query_status<T>(result: &Result<T, StoreError>) -> &'static str {
  match result {
    Ok(_) => "success",
    Err(err) if err.is_validation() => "validation_error",
    Err(StoreError::NotFound { .. }) => "not_found",
    Err(_) => "error",
  }
}

fn bind(value: &FieldValue) -> Value {
  match value {
    FieldValue::Text(text) => text.clone().into(),
    FieldValue::Int(n) => (*n).into(),
    FieldValue::Null => Value::String(None),
  }
}

fn quote(backend: DatabaseBackend, identifier: &str) -> String {
  match backend {
    DatabaseBackend::MySql => format!("`{}`", identifier),
    _ => format!("\"{}\"", identifier),
  }
}

fn placeholder(backend: DatabaseBackend, position: usize) -> String {
  match backend {
    DatabaseBackend::Postgres => format!("${}", position),
    _ => "?".to_string(),
  }
}

fn int_column(row: &QueryResult, column: &str) -> Result<i64, StoreError> {
  match row.try_get::<Option<i64>>("", column) {
    Ok(value) => Ok(value.unwrap_or_default()),
    Err(_) => Ok(
      row
        .try_get::<Option<i32>>("", column)?
        .map(i64::from)
        .unwrap_or_default(),
    ),
  }
}

fn text_column(row: &QueryResult, column: &str) -> Result<Option<String>, StoreError> {
  Ok(row.try_get::<Option<String>>("", column)?)
}

fn decode_record(row: &QueryResult) -> Result<Record, StoreError> {
  let status = text_column(row, "status")?.unwrap_or_default();
  Ok(Record {
    id: int_column(row, "id")?,
    status: RecordStatus::from_label(&status),
    user_message: text_column(row, "user_message")?.unwrap_or_default(),
    sys_message: text_column(row, "sys_message")?.unwrap_or_default(),
    report: text_column(row, "report")?,
    failed_times: int_column(row, "failed_times")?,
    failed_info: text_column(row, "failed_info")?,
    progress: text_column(row, "progress")?,
    progress_info: text_column(row, "progress_info")?,
    current_task_node: int_column(row, "current_task_node")?,
    callback_url: text_column(row, "callback_url")?,
  })
}
