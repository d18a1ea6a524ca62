use jobq::base::Broker;
use jobq::client::Client;
use jobq::error::{Error, SkipRetryError};
use jobq::memdb::MemoryBroker;
use jobq::serve_mux::ServeMux;
use jobq::server::{Server, ServerConfig};
use jobq::task::{QueueStats, RetryPolicy, Task};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> ServerConfig {
  ServerConfig::new()
    .concurrency(2)
    .task_check_interval(Duration::from_millis(10))
    .delayed_task_check_interval(Duration::from_millis(20))
    .shutdown_timeout(Duration::from_secs(1))
    .retry_policy(RetryPolicy::Fixed(Duration::ZERO))
}

async fn wait_for<F>(client: &Client, done: F) -> QueueStats
where
  F: Fn(&QueueStats) -> bool,
{
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
async fn processes_enqueued_task_once() {
  let broker = Arc::new(MemoryBroker::new());
  let client = Client::with_broker(broker.clone());
  client
    .enqueue(Task::new("llm:process", br#"{"id":1}"#).unwrap())
    .await
    .unwrap();

  let calls = Arc::new(AtomicUsize::new(0));
  let mut mux = ServeMux::new();
  let counter = calls.clone();
  mux.handle_func("llm:process", move |task: Task| {
    assert_eq!(task.get_payload(), br#"{"id":1}"#);
    counter.fetch_add(1, Ordering::SeqCst);
    Ok(())
  });

  let mut server = Server::with_broker(broker, fast_config()).unwrap();
  server.start(mux).await.unwrap();
  let stats = wait_for(&client, |s| s.in_flight() == 0).await;
  server.shutdown().await.unwrap();

  assert_eq!(stats.in_flight(), 0);
  assert_eq!(stats.archived, 0);
  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_task_is_retried_then_archived() {
  let broker = Arc::new(MemoryBroker::new());
  let client = Client::with_broker(broker.clone());
  client
    .enqueue(Task::new("llm:process", b"{}").unwrap().with_max_retry(2))
    .await
    .unwrap();

  let calls = Arc::new(AtomicUsize::new(0));
  let mut mux = ServeMux::new();
  let counter = calls.clone();
  mux.handle_func("llm:process", move |_task: Task| {
    counter.fetch_add(1, Ordering::SeqCst);
    Err(Error::other("upstream unavailable"))
  });

  let mut server = Server::with_broker(broker, fast_config()).unwrap();
  server.start(mux).await.unwrap();
  let stats = wait_for(&client, |s| s.archived == 1).await;
  server.shutdown().await.unwrap();

  assert_eq!(stats.archived, 1);
  assert_eq!(stats.in_flight(), 0);
  assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn skip_retry_archives_after_one_attempt() {
  let broker = Arc::new(MemoryBroker::new());
  let client = Client::with_broker(broker.clone());
  client
    .enqueue(Task::new("llm:process", b"{}").unwrap().with_max_retry(5))
    .await
    .unwrap();

  let calls = Arc::new(AtomicUsize::new(0));
  let mut mux = ServeMux::new();
  let counter = calls.clone();
  mux.handle_func("llm:process", move |_task: Task| {
    counter.fetch_add(1, Ordering::SeqCst);
    Err(SkipRetryError::new(std::io::Error::other("malformed payload")).into())
  });

  let mut server = Server::with_broker(broker, fast_config()).unwrap();
  server.start(mux).await.unwrap();
  let stats = wait_for(&client, |s| s.archived == 1).await;
  server.shutdown().await.unwrap();

  assert_eq!(stats.archived, 1);
  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transient_failure_recovers_on_retry() {
  let broker = Arc::new(MemoryBroker::new());
  let client = Client::with_broker(broker.clone());
  client
    .enqueue(Task::new("llm:process", b"{}").unwrap().with_max_retry(3))
    .await
    .unwrap();

  let calls = Arc::new(AtomicUsize::new(0));
  let mut mux = ServeMux::new();
  let counter = calls.clone();
  mux.handle_async_func("llm:*", move |task: Task| {
    let counter = counter.clone();
    async move {
      let attempt = counter.fetch_add(1, Ordering::SeqCst);
      let retried = task.metadata().map(|m| m.retried).unwrap_or_default();
      assert_eq!(retried as usize, attempt);
      if attempt == 0 {
        Err(Error::other("transient"))
      } else {
        Ok(())
      }
    }
  });

  let mut server = Server::with_broker(broker, fast_config()).unwrap();
  server.start(mux).await.unwrap();
  let stats = wait_for(&client, |s| s.in_flight() == 0).await;
  server.shutdown().await.unwrap();

  assert_eq!(stats.archived, 0);
  assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn shutdown_requeues_tasks_that_outlive_the_timeout() {
  let broker = Arc::new(MemoryBroker::new());
  let client = Client::with_broker(broker.clone());
  client
    .enqueue(Task::new("llm:process", b"{}").unwrap())
    .await
    .unwrap();

  let mut mux = ServeMux::new();
  mux.handle_async_func("llm:process", |_task: Task| async move {
    tokio::time::sleep(Duration::from_secs(60)).await;
    Ok(())
  });

  let config = fast_config().shutdown_timeout(Duration::from_millis(100));
  let mut server = Server::with_broker(broker, config).unwrap();
  server.start(mux).await.unwrap();
  wait_for(&client, |s| s.active == 1).await;
  server.shutdown().await.unwrap();

  let stats = client.queue_stats("default").await.unwrap();
  assert_eq!(stats.pending, 1);
  assert_eq!(stats.active, 0);
  assert_eq!(stats.retry, 0);
}

#[tokio::test]
async fn task_of_a_crashed_worker_is_recovered_and_redelivered() {
  let broker = Arc::new(MemoryBroker::new());
  let client = Client::with_broker(broker.clone());
  client
    .enqueue(Task::new("llm:process", b"{}").unwrap().with_max_retry(3))
    .await
    .unwrap();

  // A worker takes the task and dies without reporting back.
  let orphan = broker
    .dequeue(&["default".to_string()])
    .await
    .unwrap()
    .unwrap();
  broker
    .storage()
    .write()
    .await
    .get_or_create_queue("default")
    .lease
    .insert(orphan.id.clone(), chrono::Utc::now().timestamp() - 120);
  assert_eq!(client.queue_stats("default").await.unwrap().active, 1);

  let calls = Arc::new(AtomicUsize::new(0));
  let mut mux = ServeMux::new();
  let counter = calls.clone();
  mux.handle_func("llm:process", move |task: Task| {
    assert_eq!(task.metadata().map(|m| m.retried), Some(1));
    counter.fetch_add(1, Ordering::SeqCst);
    Ok(())
  });

  let config = fast_config().recoverer_interval(Duration::from_millis(10));
  let mut server = Server::with_broker(broker, config).unwrap();
  server.start(mux).await.unwrap();
  let stats = wait_for(&client, |s| s.in_flight() == 0).await;
  server.shutdown().await.unwrap();

  assert_eq!(stats.in_flight(), 0);
  assert_eq!(stats.archived, 0);
  assert_eq!(calls.load(Ordering::SeqCst), 1);
}
