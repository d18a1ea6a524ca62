//! 内存记录存储
//! In-process record store
//!
//! 用于测试和本地运行的 [`RecordStore`]，支持故障注入并按顺序记录每次调用
//! A [`RecordStore`] for tests and local runs, with failure injection and an ordered
//! log of every call

use super::{
  check_update, validate_identifier, FieldMap, FieldValue, Record, RecordStatus, RecordStore,
  StoreError,
};
use crate::url_guard::UrlGuard;
use async_trait::async_trait;
use sea_orm::DbErr;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// 可以被注入故障的操作
/// Operations that can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
  Get,
  UpdateStatus,
  UpdateFailure,
  UpdateFields,
}

/// 存储收到的一次调用及其参数
/// One call the store received, with its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
  Get,
  UpdateStatus(RecordStatus),
  UpdateFailure { failed_times: i64 },
  UpdateFields(FieldMap),
}

impl StoreCall {
  pub fn op(&self) -> StoreOp {
    match self {
      StoreCall::Get => StoreOp::Get,
      StoreCall::UpdateStatus(_) => StoreOp::UpdateStatus,
      StoreCall::UpdateFailure { .. } => StoreOp::UpdateFailure,
      StoreCall::UpdateFields(_) => StoreOp::UpdateFields,
    }
  }
}

#[derive(Default)]
struct State {
  tables: HashMap<String, BTreeMap<i64, Record>>,
  failures: VecDeque<StoreOp>,
  // Every call that passed validation, with whether it succeeded.
  log: Vec<(StoreCall, bool)>,
}

pub struct MemoryRecordStore {
  state: Mutex<State>,
  guard: UrlGuard,
}

impl MemoryRecordStore {
  pub fn new(guard: UrlGuard) -> Self {
    Self {
      state: Mutex::new(State::default()),
      guard,
    }
  }

  pub fn insert(&self, table: &str, record: Record) {
    self
      .lock()
      .tables
      .entry(table.to_string())
      .or_default()
      .insert(record.id, record);
  }

  pub fn snapshot(&self, table: &str, id: i64) -> Option<Record> {
    self
      .lock()
      .tables
      .get(table)
      .and_then(|rows| rows.get(&id))
      .cloned()
  }

  /// 让下一次 `op` 调用返回数据库错误
  /// Make the next call of `op` fail with a database error
  pub fn fail_next(&self, op: StoreOp) {
    self.lock().failures.push_back(op);
  }

  /// 按顺序返回每次通过校验的调用，包括失败的调用
  /// Every call that passed validation, in order, failed ones included
  pub fn calls(&self) -> Vec<StoreCall> {
    self.lock().log.iter().map(|(call, _)| call.clone()).collect()
  }

  /// 成功的 `update_fields` 收到的字段集合，按顺序
  /// Field maps of the successful `update_fields` calls, in order
  pub fn field_updates(&self) -> Vec<FieldMap> {
    self
      .lock()
      .log
      .iter()
      .filter_map(|(call, ok)| match call {
        StoreCall::UpdateFields(fields) if *ok => Some(fields.clone()),
        _ => None,
      })
      .collect()
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn with_record<F>(&self, call: StoreCall, table: &str, id: i64, apply: F) -> Result<(), StoreError>
  where
    F: FnOnce(&mut Record) -> Result<(), StoreError>,
  {
    let mut state = self.lock();
    let result = update_row(&mut state, call.op(), table, id, apply);
    state.log.push((call, result.is_ok()));
    result
  }
}

fn update_row<F>(
  state: &mut State,
  op: StoreOp,
  table: &str,
  id: i64,
  apply: F,
) -> Result<(), StoreError>
where
  F: FnOnce(&mut Record) -> Result<(), StoreError>,
{
  take_failure(state, op)?;
  let row = state
    .tables
    .get_mut(table)
    .and_then(|rows| rows.get_mut(&id));
  // Matches SQL: an update that hits no row is not an error.
  let Some(row) = row else {
    return Ok(());
  };
  let mut updated = row.clone();
  apply(&mut updated)?;
  *row = updated;
  Ok(())
}

impl Default for MemoryRecordStore {
  fn default() -> Self {
    Self::new(UrlGuard::default())
  }
}

fn take_failure(state: &mut State, op: StoreOp) -> Result<(), StoreError> {
  if let Some(pos) = state.failures.iter().position(|o| *o == op) {
    state.failures.remove(pos);
    return Err(StoreError::Database(DbErr::Custom(format!(
      "injected failure for {:?}",
      op
    ))));
  }
  Ok(())
}

fn set_field(record: &mut Record, name: &str, value: &FieldValue) -> Result<(), StoreError> {
  let text = || match value {
    FieldValue::Text(s) => Some(s.clone()),
    FieldValue::Int(n) => Some(n.to_string()),
    FieldValue::Null => None,
  };
  let int = || -> Result<i64, StoreError> {
    match value {
      FieldValue::Int(n) => Ok(*n),
      FieldValue::Null => Ok(0),
      FieldValue::Text(s) => s.parse::<i64>().map_err(|_| {
        StoreError::Database(DbErr::Custom(format!("column {} expects an integer", name)))
      }),
    }
  };
  match name {
    "status" => record.status = RecordStatus::from_label(&text().unwrap_or_default()),
    "user_message" => record.user_message = text().unwrap_or_default(),
    "sys_message" => record.sys_message = text().unwrap_or_default(),
    "report" => record.report = text(),
    "failed_times" => record.failed_times = int()?,
    "failed_info" => record.failed_info = text(),
    "progress" => record.progress = text(),
    "progress_info" => record.progress_info = text(),
    "current_task_node" => record.current_task_node = int()?,
    "callback_url" => record.callback_url = text(),
    other => {
      return Err(DbErr::Custom(format!("unknown column {}", other)).into());
    }
  }
  Ok(())
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
  async fn get(&self, table: &str, id: i64) -> Result<Record, StoreError> {
    validate_identifier(table)?;
    let mut state = self.lock();
    let result = take_failure(&mut state, StoreOp::Get).and_then(|()| {
      state
        .tables
        .get(table)
        .and_then(|rows| rows.get(&id))
        .cloned()
        .ok_or_else(|| StoreError::NotFound {
          table: table.to_string(),
          id,
        })
    });
    state.log.push((StoreCall::Get, result.is_ok()));
    result
  }

  async fn update_status(
    &self,
    table: &str,
    id: i64,
    status: RecordStatus,
  ) -> Result<(), StoreError> {
    validate_identifier(table)?;
    self.with_record(StoreCall::UpdateStatus(status), table, id, |record| {
      record.status = status;
      Ok(())
    })
  }

  async fn update_failure(
    &self,
    table: &str,
    id: i64,
    error_text: &str,
    failed_times: i64,
  ) -> Result<(), StoreError> {
    validate_identifier(table)?;
    let call = StoreCall::UpdateFailure { failed_times };
    self.with_record(call, table, id, |record| {
      record.failed_info = Some(error_text.to_string());
      record.failed_times = failed_times;
      Ok(())
    })
  }

  async fn update_fields(&self, table: &str, id: i64, fields: FieldMap) -> Result<(), StoreError> {
    check_update(&self.guard, table, &fields).await?;
    let call = StoreCall::UpdateFields(fields.clone());
    self.with_record(call, table, id, |record| {
      for (name, value) in &fields {
        set_field(record, name, value)?;
      }
      Ok(())
    })
  }

  async fn ping(&self) -> Result<(), StoreError> {
    Ok(())
  }
}
