use jobq_worker::store::{
  fields, FieldValue, RecordStatus, RecordStore, SqlRecordStore, StoreError, FIELD_CALLBACK_URL,
  FIELD_CURRENT_TASK_NODE, FIELD_REPORT, FIELD_STATUS,
};
use jobq_worker::url_guard::{StaticResolver, UrlGuard};
use sea_orm::ConnectionTrait;
use std::net::IpAddr;
use std::sync::Arc;

const TABLE: &str = "valuation_records";

async fn store() -> SqlRecordStore {
  let resolver = StaticResolver::new()
    .with_host("hooks.example.com", &["93.184.216.34".parse::<IpAddr>().unwrap()])
    .with_host("intranet.example.com", &["10.0.0.8".parse::<IpAddr>().unwrap()]);
  let guard = UrlGuard::new().with_resolver(Arc::new(resolver));
  let store = SqlRecordStore::connect("sqlite::memory:", 1, guard)
    .await
    .unwrap();
  store
    .db()
    .execute_unprepared(
      r#"
        CREATE TABLE valuation_records (
          id INTEGER PRIMARY KEY,
          status TEXT,
          user_message TEXT,
          sys_message TEXT,
          report TEXT,
          failed_times INTEGER NOT NULL DEFAULT 0,
          failed_info TEXT,
          progress TEXT,
          progress_info TEXT,
          current_task_node INTEGER NOT NULL DEFAULT 0,
          callback_url TEXT
        )
      "#,
    )
    .await
    .unwrap();
  store
    .db()
    .execute_unprepared(
      r#"
        INSERT INTO valuation_records (id, status, user_message, sys_message, current_task_node)
        VALUES (1, '待处理', 'value my car', 'you are an appraiser', 4)
      "#,
    )
    .await
    .unwrap();
  store
}

#[tokio::test]
async fn reads_a_record() {
  let store = store().await;
  store.ping().await.unwrap();

  let record = store.get(TABLE, 1).await.unwrap();
  assert_eq!(record.id, 1);
  assert_eq!(record.status, RecordStatus::Pending);
  assert_eq!(record.user_message, "value my car");
  assert_eq!(record.sys_message, "you are an appraiser");
  assert_eq!(record.report, None);
  assert_eq!(record.failed_times, 0);
  assert_eq!(record.current_task_node, 4);
  assert_eq!(record.callback_url(), None);

  assert!(matches!(
    store.get(TABLE, 99).await,
    Err(StoreError::NotFound { id: 99, .. })
  ));
}

#[tokio::test]
async fn writes_status_failure_and_fields() {
  let store = store().await;

  store
    .update_status(TABLE, 1, RecordStatus::Processing)
    .await
    .unwrap();
  assert_eq!(
    store.get(TABLE, 1).await.unwrap().status,
    RecordStatus::Processing
  );

  store.update_failure(TABLE, 1, "timeout", 2).await.unwrap();
  let record = store.get(TABLE, 1).await.unwrap();
  assert_eq!(record.failed_info.as_deref(), Some("timeout"));
  assert_eq!(record.failed_times, 2);

  store
    .update_fields(
      TABLE,
      1,
      fields([
        (FIELD_STATUS, FieldValue::from(RecordStatus::Completed)),
        (FIELD_REPORT, FieldValue::from("fair value 9000")),
        (FIELD_CURRENT_TASK_NODE, FieldValue::from(5_i64)),
        (
          FIELD_CALLBACK_URL,
          FieldValue::from("https://hooks.example.com/done"),
        ),
      ]),
    )
    .await
    .unwrap();
  let record = store.get(TABLE, 1).await.unwrap();
  assert_eq!(record.status, RecordStatus::Completed);
  assert_eq!(record.report.as_deref(), Some("fair value 9000"));
  assert_eq!(record.current_task_node, 5);
  assert_eq!(
    record.callback_url(),
    Some("https://hooks.example.com/done")
  );

  store
    .update_fields(TABLE, 1, fields([(FIELD_REPORT, FieldValue::Null)]))
    .await
    .unwrap();
  assert_eq!(store.get(TABLE, 1).await.unwrap().report, None);
}

#[tokio::test]
async fn unsafe_callback_url_fails_the_whole_update() {
  let store = store().await;

  let err = store
    .update_fields(
      TABLE,
      1,
      fields([
        (FIELD_REPORT, "should not land"),
        (FIELD_CALLBACK_URL, "https://intranet.example.com/hook"),
      ]),
    )
    .await
    .unwrap_err();
  assert!(matches!(err, StoreError::UnsafeCallbackUrl(_)));

  let record = store.get(TABLE, 1).await.unwrap();
  assert_eq!(record.report, None);
  assert_eq!(record.callback_url(), None);
}

#[tokio::test]
async fn hostile_identifiers_never_reach_the_database() {
  let store = store().await;

  for table in ["valuation_records; DROP TABLE x", "select", "a.b", ""] {
    assert!(store.get(table, 1).await.unwrap_err().is_validation());
  }
  let err = store
    .update_fields(TABLE, 1, fields([("report = 'x' --", "y")]))
    .await
    .unwrap_err();
  assert!(matches!(err, StoreError::InvalidIdentifier(_)));

  let err = store
    .update_status("Table", 1, RecordStatus::Failed)
    .await
    .unwrap_err();
  assert!(matches!(err, StoreError::ReservedIdentifier(_)));

  // Still intact.
  assert_eq!(
    store.get(TABLE, 1).await.unwrap().status,
    RecordStatus::Pending
  );
}
