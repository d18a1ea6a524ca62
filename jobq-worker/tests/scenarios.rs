use jobq::client::Client;
use jobq::memdb::MemoryBroker;
use jobq::server::{Server, ServerConfig};
use jobq::task::{QueueStats, RetryPolicy};
use jobq_worker::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use jobq_worker::callback::CallbackNotifier;
use jobq_worker::completion::{http_client, CompletionClient, CompletionConfig, CompletionError};
use jobq_worker::handler::{JobError, LlmTaskHandler, Outcome};
use jobq_worker::payload::{LlmPayload, LlmTaskProducer};
use jobq_worker::store::{
  FieldValue, MemoryRecordStore, Record, RecordStatus, StoreCall, FIELD_STATUS,
};
use jobq_worker::url_guard::{loopback_v4, StaticResolver, UrlGuard};
use jobq_worker::worker::routes;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const TABLE: &str = "valuation_records";

struct Harness {
  store: Arc<MemoryRecordStore>,
  breaker: Arc<CircuitBreaker>,
  handler: LlmTaskHandler,
}

fn guard() -> UrlGuard {
  UrlGuard::new()
    .with_resolver(Arc::new(StaticResolver::new()))
    .exempt(loopback_v4())
}

fn harness(api: &MockServer, breaker: BreakerConfig) -> Harness {
  let store = Arc::new(MemoryRecordStore::new(guard()));
  let breaker = Arc::new(CircuitBreaker::new(breaker));
  let http = http_client(Duration::from_secs(2)).unwrap();
  let completion = CompletionClient::with_http(
    http.clone(),
    CompletionConfig {
      base_url: format!("{}/v1/chat/completions", api.uri()),
      api_key: "sk-test".into(),
      model: "deepseek-chat".into(),
      max_tokens: 512,
      timeout: Duration::from_secs(2),
    },
    breaker.clone(),
  );
  let handler = LlmTaskHandler::new(
    store.clone(),
    Arc::new(completion),
    CallbackNotifier::new(http, guard()),
  );
  Harness {
    store,
    breaker,
    handler,
  }
}

fn record(id: i64) -> Record {
  let mut record = Record::new(id, "You are an appraiser.", "Value a 2015 sedan.");
  record.current_task_node = 2;
  record
}

fn reply(content: &str) -> ResponseTemplate {
  ResponseTemplate::new(200).set_body_json(json!({
    "choices": [{"message": {"role": "assistant", "content": content}}]
  }))
}

#[tokio::test]
async fn success_completes_record() {
  let api = MockServer::start().await;
  Mock::given(method("POST"))
    .and(path("/v1/chat/completions"))
    .respond_with(reply("ok"))
    .expect(1)
    .mount(&api)
    .await;

  let h = harness(&api, BreakerConfig::default());
  h.store.insert(TABLE, record(123));

  let outcome = h
    .handler
    .process(&LlmPayload::new(TABLE, 123))
    .await
    .unwrap();
  assert_eq!(outcome, Outcome::Completed);

  let stored = h.store.snapshot(TABLE, 123).unwrap();
  assert_eq!(stored.status, RecordStatus::Completed);
  assert_eq!(stored.report.as_deref(), Some("ok"));
  assert_eq!(stored.current_task_node, 3);
  assert_eq!(stored.failed_times, 0);
}

fn status_of(call: &StoreCall) -> Option<RecordStatus> {
  match call {
    StoreCall::UpdateStatus(status) => Some(*status),
    StoreCall::UpdateFields(fields) => match fields.get(FIELD_STATUS) {
      Some(FieldValue::Text(label)) => Some(RecordStatus::from_label(label)),
      _ => None,
    },
    _ => None,
  }
}

#[tokio::test]
async fn record_is_processing_while_the_model_is_called() {
  let api = MockServer::start().await;
  let h = harness(&api, BreakerConfig::default());
  h.store.insert(TABLE, record(31));

  let seen = Arc::new(Mutex::new(None));
  let observed = seen.clone();
  let store = h.store.clone();
  Mock::given(method("POST"))
    .respond_with(move |_request: &Request| {
      *observed.lock().unwrap() = store.snapshot(TABLE, 31).map(|r| r.status);
      reply("ok")
    })
    .expect(1)
    .mount(&api)
    .await;

  h.handler
    .process(&LlmPayload::new(TABLE, 31))
    .await
    .unwrap();

  assert_eq!(*seen.lock().unwrap(), Some(RecordStatus::Processing));
  let calls = h.store.calls();
  assert_eq!(calls.len(), 3, "{calls:?}");
  assert_eq!(calls[0], StoreCall::Get);
  assert_eq!(calls[1], StoreCall::UpdateStatus(RecordStatus::Processing));
  assert!(matches!(calls[2], StoreCall::UpdateFields(_)));
  assert_eq!(status_of(&calls[2]), Some(RecordStatus::Completed));
}

#[tokio::test]
async fn downstream_error_marks_record_failed_in_one_update() {
  let api = MockServer::start().await;
  Mock::given(method("POST"))
    .respond_with(ResponseTemplate::new(500).set_body_string("model overloaded"))
    .mount(&api)
    .await;

  let h = harness(&api, BreakerConfig::default());
  let mut seeded = record(7);
  seeded.failed_times = 2;
  h.store.insert(TABLE, seeded);

  let err = h
    .handler
    .process(&LlmPayload::new(TABLE, 7))
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    JobError::Completion(CompletionError::Status { status: 500, .. })
  ));
  assert!(err.is_retryable());

  let stored = h.store.snapshot(TABLE, 7).unwrap();
  assert_eq!(stored.status, RecordStatus::Failed);
  assert_eq!(stored.failed_times, 3);
  let info = stored.failed_info.unwrap();
  assert!(info.contains("500"), "{info}");
  assert!(info.contains("model overloaded"), "{info}");

  let updates = h.store.field_updates();
  assert_eq!(updates.len(), 1);
  assert_eq!(updates[0].len(), 3);

  let statuses: Vec<_> = h.store.calls().iter().map(status_of).collect();
  assert_eq!(
    statuses,
    vec![
      None,
      Some(RecordStatus::Processing),
      Some(RecordStatus::Failed)
    ]
  );
}

#[tokio::test]
async fn unsafe_callback_is_rejected_without_affecting_the_job() {
  let api = MockServer::start().await;
  Mock::given(method("POST"))
    .respond_with(reply("report body"))
    .expect(1)
    .mount(&api)
    .await;

  let h = harness(&api, BreakerConfig::default());
  let mut seeded = record(9);
  seeded.callback_url = Some("http://169.254.169.254/".into());
  h.store.insert(TABLE, seeded);

  let outcome = h
    .handler
    .process(&LlmPayload::new(TABLE, 9))
    .await
    .unwrap();
  assert_eq!(outcome, Outcome::Completed);
  assert_eq!(
    h.store.snapshot(TABLE, 9).unwrap().status,
    RecordStatus::Completed
  );
}

#[tokio::test]
async fn callback_receives_report() {
  let api = MockServer::start().await;
  Mock::given(method("POST"))
    .and(path("/v1/chat/completions"))
    .respond_with(reply("worth 42"))
    .mount(&api)
    .await;
  Mock::given(method("POST"))
    .and(path("/hook"))
    .and(body_partial_json(
      json!({"result": "worth 42", "status": "success"}),
    ))
    .respond_with(ResponseTemplate::new(200))
    .expect(1)
    .mount(&api)
    .await;

  let h = harness(&api, BreakerConfig::default());
  let mut seeded = record(11);
  seeded.callback_url = Some(format!("{}/hook", api.uri()));
  h.store.insert(TABLE, seeded);

  h.handler
    .process(&LlmPayload::new(TABLE, 11))
    .await
    .unwrap();
}

#[tokio::test]
async fn failing_callback_is_swallowed() {
  let api = MockServer::start().await;
  Mock::given(method("POST"))
    .and(path("/v1/chat/completions"))
    .respond_with(reply("ok"))
    .mount(&api)
    .await;
  Mock::given(method("POST"))
    .and(path("/hook"))
    .respond_with(ResponseTemplate::new(503))
    .expect(1)
    .mount(&api)
    .await;

  let h = harness(&api, BreakerConfig::default());
  let mut seeded = record(12);
  seeded.callback_url = Some(format!("{}/hook", api.uri()));
  h.store.insert(TABLE, seeded);

  let outcome = h
    .handler
    .process(&LlmPayload::new(TABLE, 12))
    .await
    .unwrap();
  assert_eq!(outcome, Outcome::Completed);
}

#[tokio::test]
async fn breaker_trips_after_five_failures_and_fails_fast() {
  let api = MockServer::start().await;
  Mock::given(method("POST"))
    .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
    .expect(5)
    .mount(&api)
    .await;

  let h = harness(
    &api,
    BreakerConfig::default()
      .fail_threshold(0.5)
      .min_requests(5),
  );
  for id in 1..=6 {
    h.store.insert(TABLE, record(id));
  }

  for id in 1..=5 {
    let err = h
      .handler
      .process(&LlmPayload::new(TABLE, id))
      .await
      .unwrap_err();
    assert!(!err.is_circuit_open());
  }
  assert_eq!(h.breaker.state(), BreakerState::Open);

  let err = h
    .handler
    .process(&LlmPayload::new(TABLE, 6))
    .await
    .unwrap_err();
  assert!(err.is_circuit_open());
  assert!(err.is_retryable());

  let stored = h.store.snapshot(TABLE, 6).unwrap();
  assert_eq!(stored.status, RecordStatus::Failed);
  assert!(stored
    .failed_info
    .unwrap()
    .contains("circuit breaker is open"));
}

#[tokio::test]
async fn redelivered_completed_job_is_acknowledged_without_api_call() {
  let api = MockServer::start().await;
  Mock::given(method("POST"))
    .respond_with(reply("first"))
    .expect(1)
    .mount(&api)
    .await;

  let h = harness(&api, BreakerConfig::default());
  h.store.insert(TABLE, record(5));

  let payload = LlmPayload::new(TABLE, 5);
  assert_eq!(
    h.handler.process(&payload).await.unwrap(),
    Outcome::Completed
  );
  assert_eq!(
    h.handler.process(&payload).await.unwrap(),
    Outcome::AlreadyCompleted
  );
  let stored = h.store.snapshot(TABLE, 5).unwrap();
  assert_eq!(stored.report.as_deref(), Some("first"));
  assert_eq!(stored.current_task_node, 3);
}

#[tokio::test]
async fn failed_record_can_be_retried_to_completion() {
  let api = MockServer::start().await;
  Mock::given(method("POST"))
    .respond_with(ResponseTemplate::new(500).set_body_string("try later"))
    .up_to_n_times(1)
    .mount(&api)
    .await;
  Mock::given(method("POST"))
    .respond_with(reply("second time lucky"))
    .mount(&api)
    .await;

  let h = harness(&api, BreakerConfig::default());
  h.store.insert(TABLE, record(8));

  let payload = LlmPayload::new(TABLE, 8);
  assert!(h.handler.process(&payload).await.is_err());
  assert_eq!(
    h.handler.process(&payload).await.unwrap(),
    Outcome::Completed
  );

  let stored = h.store.snapshot(TABLE, 8).unwrap();
  assert_eq!(stored.status, RecordStatus::Completed);
  assert_eq!(stored.failed_times, 1);
  assert_eq!(stored.report.as_deref(), Some("second time lucky"));
}

async fn wait_for(client: &Client, done: impl Fn(&QueueStats) -> bool) -> QueueStats {
  let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
  loop {
    let stats = client.queue_stats("default").await.unwrap();
    if done(&stats) || tokio::time::Instant::now() > deadline {
      return stats;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}

#[tokio::test]
async fn queued_job_is_retried_by_the_server_until_it_completes() {
  let api = MockServer::start().await;
  Mock::given(method("POST"))
    .respond_with(ResponseTemplate::new(500).set_body_string("cold start"))
    .up_to_n_times(1)
    .mount(&api)
    .await;
  Mock::given(method("POST"))
    .respond_with(reply("queued report"))
    .mount(&api)
    .await;

  let h = harness(&api, BreakerConfig::default());
  h.store.insert(TABLE, record(21));

  let broker = Arc::new(MemoryBroker::new());
  let client = Client::with_broker(broker.clone());
  LlmTaskProducer::new(Client::with_broker(broker.clone()))
    .max_retry(3)
    .enqueue(TABLE, 21)
    .await
    .unwrap();

  let config = ServerConfig::new()
    .concurrency(2)
    .task_check_interval(Duration::from_millis(10))
    .delayed_task_check_interval(Duration::from_millis(20))
    .shutdown_timeout(Duration::from_secs(1))
    .retry_policy(RetryPolicy::Fixed(Duration::ZERO));
  let mut server = Server::with_broker(broker, config).unwrap();
  server.start(routes(h.handler)).await.unwrap();
  let stats = wait_for(&client, |s| s.in_flight() == 0).await;
  server.shutdown().await.unwrap();

  assert_eq!(stats.in_flight(), 0);
  assert_eq!(stats.archived, 0);
  let stored = h.store.snapshot(TABLE, 21).unwrap();
  assert_eq!(stored.status, RecordStatus::Completed);
  assert_eq!(stored.failed_times, 1);
}

#[tokio::test]
async fn malformed_job_is_archived_without_retry() {
  let api = MockServer::start().await;
  let h = harness(&api, BreakerConfig::default());

  let broker = Arc::new(MemoryBroker::new());
  let client = Client::with_broker(broker.clone());
  client
    .enqueue(
      jobq::task::Task::new(jobq_worker::payload::TYPE_LLM, b"{\"id\": \"x\"}")
        .unwrap()
        .with_max_retry(5),
    )
    .await
    .unwrap();

  let config = ServerConfig::new()
    .task_check_interval(Duration::from_millis(10))
    .retry_policy(RetryPolicy::Fixed(Duration::ZERO));
  let mut server = Server::with_broker(broker, config).unwrap();
  server.start(routes(h.handler)).await.unwrap();
  let stats = wait_for(&client, |s| s.archived == 1).await;
  server.shutdown().await.unwrap();

  assert_eq!(stats.archived, 1);
  assert_eq!(stats.retry, 0);
}
