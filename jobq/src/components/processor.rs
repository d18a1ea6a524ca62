//! 处理器模块
//! Processor module
//!
//! Processor 是任务处理的核心组件，负责从队列中取出任务并交给 Handler 执行。
//! The Processor is the core component for task processing, responsible for dequeuing
//! tasks and handing them to the Handler.
//!
//! ## 主要特性 / Key Features
//!
//! - **信号量并发控制**: 使用 Tokio Semaphore 限制并发工作者数量
//!   - **Semaphore-based concurrency**: Uses a Tokio Semaphore to bound concurrent workers
//!
//! - **队列优先级**: 支持严格优先级和加权优先级两种模式
//!   - **Queue priority**: Supports both strict priority and weighted priority modes
//!
//! - **任务超时**: 超时、截止时间或默认超时，先到者为准
//!   - **Task timeout**: Task timeout, deadline, or the default timeout
//!
//! - **重试与归档**: 失败任务按重试策略延迟重试，重试耗尽或跳过重试时归档
//!   - **Retry and archive**: Failed tasks are retried after the policy delay, archived once
//!     retries are exhausted or skipped
//!
//! - **优雅关闭**: 等待工作者完成；超时后取消仍在运行的任务并放回待处理队列
//!   - **Graceful shutdown**: Waits for workers; after the timeout, in-flight tasks are
//!     cancelled and put back to pending

use crate::base::constants::DEFAULT_TIMEOUT;
use crate::base::Broker;
use crate::error::{Error, Result};
use crate::proto::TaskMessage;
use crate::server::Handler;
use crate::task::{RetryPolicy, Task};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 处理器参数
/// Processor parameters
pub struct ProcessorParams {
  pub broker: Arc<dyn Broker>,
  pub queues: HashMap<String, i32>,
  pub concurrency: usize,
  pub strict_priority: bool,
  pub task_check_interval: Duration,
  pub shutdown_timeout: Duration,
  pub retry_policy: RetryPolicy,
  pub active_workers: Arc<AtomicUsize>,
}

/// 任务取消追踪结构
/// Task cancellation tracking structure
#[derive(Clone, Default)]
pub struct CancellationMap {
  // 正在运行的任务：任务 ID -> (队列, 取消令牌)
  // Running tasks: task ID -> (queue, cancellation token)
  tasks: Arc<Mutex<HashMap<String, (String, CancellationToken)>>>,
}

impl CancellationMap {
  /// 创建新的实例
  /// Create a new instance
  pub fn new() -> Self {
    Self::default()
  }

  /// 添加任务取消令牌
  /// Add task cancellation token
  pub fn add(&self, queue: &str, task_id: String, token: CancellationToken) {
    let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
    tasks.insert(task_id, (queue.to_string(), token));
  }

  /// 移除任务取消令牌
  /// Remove task cancellation token
  pub fn remove(&self, task_id: &str) {
    let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
    tasks.remove(task_id);
  }

  /// 取消指定的任务
  /// Cancel the specified task
  pub fn cancel(&self, task_id: &str) -> bool {
    let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
    match tasks.get(task_id) {
      Some((_, token)) => {
        tracing::info!("canceling task {}", task_id);
        token.cancel();
        true
      }
      None => false,
    }
  }

  /// 取消所有正在运行的任务，返回取消的数量
  /// Cancel all running tasks, returns how many were cancelled
  pub fn cancel_all(&self) -> usize {
    let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
    for (_, token) in tasks.values() {
      token.cancel();
    }
    tasks.len()
  }

  /// 按队列分组的正在运行的任务 ID
  /// IDs of running tasks grouped by queue
  pub fn running_by_queue(&self) -> HashMap<String, Vec<String>> {
    let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
    for (id, (queue, _)) in tasks.iter() {
      grouped.entry(queue.clone()).or_default().push(id.clone());
    }
    grouped
  }

  /// 获取正在运行的任务数量
  /// Get the number of running tasks
  pub fn len(&self) -> usize {
    self
      .tasks
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  /// 检查是否为空
  /// Check if empty
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// 单个工作者需要的共享状态
/// Shared state needed by a single worker
struct Worker<H> {
  broker: Arc<dyn Broker>,
  handler: Arc<H>,
  retry_policy: RetryPolicy,
  cancellations: CancellationMap,
  active_workers: Arc<AtomicUsize>,
}

impl<H> Clone for Worker<H> {
  fn clone(&self) -> Self {
    Self {
      broker: Arc::clone(&self.broker),
      handler: Arc::clone(&self.handler),
      retry_policy: self.retry_policy.clone(),
      cancellations: self.cancellations.clone(),
      active_workers: Arc::clone(&self.active_workers),
    }
  }
}

impl<H> Worker<H>
where
  H: Handler + 'static,
{
  /// 执行一个任务并按结果更新其状态
  /// Execute one task and update its state according to the result
  async fn process(self, msg: TaskMessage) {
    self.active_workers.fetch_add(1, Ordering::Relaxed);

    let result = match Task::from_message(&msg) {
      Ok(task) => self.execute(&msg, task).await,
      Err(e) => Err(e),
    };
    self.finish(&msg, result).await;

    self.active_workers.fetch_sub(1, Ordering::Relaxed);
  }

  async fn execute(&self, msg: &TaskMessage, task: Task) -> Result<()> {
    let cancel_token = CancellationToken::new();
    self
      .cancellations
      .add(&msg.queue, msg.id.clone(), cancel_token.clone());

    let timeout = calculate_task_timeout(msg);
    let handler = Arc::clone(&self.handler);
    // 在独立任务中运行，超时或取消时中止，panic 视为失败
    // Runs in its own task: aborted on timeout or cancel, a panic counts as a failure
    let mut job = tokio::spawn(async move { handler.process_task(task).await });

    let result = tokio::select! {
      joined = &mut job => match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(Error::other(format!("handler panicked: {e}"))),
        Err(_) => Err(Error::Cancelled),
      },
      _ = tokio::time::sleep(timeout) => {
        job.abort();
        tracing::warn!("Task {} timed out after {:?}", msg.id, timeout);
        Err(Error::Timeout)
      }
      _ = cancel_token.cancelled() => {
        job.abort();
        tracing::info!("Task {} was cancelled", msg.id);
        Err(Error::Cancelled)
      }
    };

    self.cancellations.remove(&msg.id);
    result
  }

  async fn finish(&self, msg: &TaskMessage, result: Result<()>) {
    match result {
      Ok(()) => {
        if let Err(e) = self.broker.done(msg).await {
          tracing::error!("Failed to mark task {} as done: {}", msg.id, e);
        }
      }
      Err(Error::Cancelled) => {
        // 不计入重试次数
        // Not counted as a retry
        if let Err(e) = self.broker.requeue(msg).await {
          tracing::error!("Failed to requeue cancelled task {}: {}", msg.id, e);
        }
      }
      Err(e) if e.is_skip_retry() => {
        tracing::warn!("Task {} failed and skips retry: {}", msg.id, e);
        if let Err(e) = self.broker.archive(msg, &e.to_string()).await {
          tracing::error!("Failed to archive task {}: {}", msg.id, e);
        }
      }
      Err(e) if msg.retried >= msg.retry => {
        tracing::warn!(
          "Retry exhausted for task {} ({}/{}): {}",
          msg.id,
          msg.retried,
          msg.retry,
          e
        );
        if let Err(e) = self.broker.archive(msg, &e.to_string()).await {
          tracing::error!("Failed to archive task {}: {}", msg.id, e);
        }
      }
      Err(e) => {
        let delay = self.retry_policy.calculate_delay(msg.retried + 1);
        let retry_at = chrono::Utc::now()
          + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        tracing::warn!(
          "Task {} failed (attempt {}/{}), retrying in {:?}: {}",
          msg.id,
          msg.retried + 1,
          msg.retry + 1,
          delay,
          e
        );
        if let Err(e) = self.broker.retry(msg, retry_at, &e.to_string()).await {
          tracing::error!("Failed to schedule retry for task {}: {}", msg.id, e);
        }
      }
    }
  }
}

/// 处理器 - 负责从队列中取出任务并处理
/// Processor - responsible for dequeuing and processing tasks
pub struct Processor {
  broker: Arc<dyn Broker>,
  queue_config: HashMap<String, i32>,
  ordered_queues: Option<Vec<String>>,
  task_check_interval: Duration,
  shutdown_timeout: Duration,
  retry_policy: RetryPolicy,
  concurrency: usize,

  // 信号量用于限制并发工作者数量
  // Semaphore to limit number of concurrent workers
  sema: Arc<Semaphore>,

  // 停止取新任务
  // Stop fetching new tasks
  stop: CancellationToken,

  // 处理器主循环句柄
  // Main processor loop handle
  handle: Option<JoinHandle<()>>,

  active_workers: Arc<AtomicUsize>,
  cancellations: CancellationMap,
}

impl Processor {
  /// 创建新的处理器
  /// Create a new processor
  pub fn new(params: ProcessorParams) -> Self {
    let queues = normalize_queues(params.queues);
    let ordered_queues = params
      .strict_priority
      .then(|| sort_by_priority(&queues));
    let concurrency = params.concurrency.max(1);

    Self {
      broker: params.broker,
      queue_config: queues,
      ordered_queues,
      task_check_interval: params.task_check_interval,
      shutdown_timeout: params.shutdown_timeout,
      retry_policy: params.retry_policy,
      concurrency,
      sema: Arc::new(Semaphore::new(concurrency)),
      stop: CancellationToken::new(),
      handle: None,
      active_workers: params.active_workers,
      cancellations: CancellationMap::new(),
    }
  }

  /// 获取任务取消追踪器的克隆
  /// Get a clone of the task cancellation tracker
  pub fn cancellations(&self) -> CancellationMap {
    self.cancellations.clone()
  }

  /// 启动处理器
  /// Start the processor
  pub fn start<H>(&mut self, handler: Arc<H>)
  where
    H: Handler + 'static,
  {
    let broker = Arc::clone(&self.broker);
    let sema = Arc::clone(&self.sema);
    let stop = self.stop.clone();
    let queue_config = self.queue_config.clone();
    let ordered_queues = self.ordered_queues.clone();
    let task_check_interval = self.task_check_interval;
    let worker = Worker {
      broker: Arc::clone(&self.broker),
      handler,
      retry_policy: self.retry_policy.clone(),
      cancellations: self.cancellations.clone(),
      active_workers: Arc::clone(&self.active_workers),
    };

    let handle = tokio::spawn(async move {
      loop {
        // 等待空闲的工作者槽位
        // Wait for a free worker slot
        let permit = tokio::select! {
          _ = stop.cancelled() => break,
          permit = Arc::clone(&sema).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => break,
          },
        };

        let queues = get_queues(&queue_config, ordered_queues.as_ref());
        let idle = match broker.dequeue(&queues).await {
          Ok(Some(msg)) => {
            let worker = worker.clone();
            tokio::spawn(async move {
              // 持有许可直到任务完成
              // Hold the permit until the task completes
              let _permit = permit;
              worker.process(msg).await;
            });
            continue;
          }
          Ok(None) => task_check_interval,
          Err(e) => {
            tracing::error!("Dequeue error: {}", e);
            Duration::from_secs(1)
          }
        };
        drop(permit);

        tokio::select! {
          _ = stop.cancelled() => break,
          _ = tokio::time::sleep(idle) => {}
        }
      }

      tracing::debug!("Processor loop exited");
    });

    self.handle = Some(handle);
  }

  /// 停止取新任务（不等待工作者完成）
  /// Stop fetching new tasks (without waiting for workers)
  pub fn stop(&self) {
    self.stop.cancel();
  }

  /// 关闭处理器并等待所有工作者完成
  /// Shutdown the processor and wait for all workers to finish
  pub async fn shutdown(&mut self) {
    self.stop();

    if let Some(handle) = self.handle.take() {
      let _ = handle.await;
    }

    tracing::info!("Waiting for all workers to finish...");
    let permits = self.concurrency as u32;
    match tokio::time::timeout(self.shutdown_timeout, self.sema.acquire_many(permits)).await {
      Ok(_) => tracing::info!("All workers have finished"),
      Err(_) => {
        let cancelled = self.cancellations.cancel_all();
        tracing::warn!(
          "Shutdown timeout elapsed, cancelled {} in-flight tasks",
          cancelled
        );
        let _ = self.sema.acquire_many(permits).await;
      }
    }
  }
}

/// 标准化队列配置，确保优先级为正数
/// Normalize queue config, ensure priorities are positive
fn normalize_queues(queues: HashMap<String, i32>) -> HashMap<String, i32> {
  queues
    .into_iter()
    .map(|(name, priority)| (name, priority.max(1)))
    .collect()
}

/// 按优先级排序队列（降序）
/// Sort queues by priority (descending)
fn sort_by_priority(queues: &HashMap<String, i32>) -> Vec<String> {
  let mut queue_vec: Vec<_> = queues.iter().collect();
  queue_vec.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
  queue_vec
    .into_iter()
    .map(|(name, _)| name.clone())
    .collect()
}

/// 获取本次出队的队列顺序
/// Get the queue order for this dequeue
fn get_queues(
  queue_config: &HashMap<String, i32>,
  ordered_queues: Option<&Vec<String>>,
) -> Vec<String> {
  if queue_config.len() == 1 {
    return queue_config.keys().cloned().collect();
  }

  if let Some(ordered) = ordered_queues {
    return ordered.clone();
  }

  // 基于优先级加权随机排序
  // Weighted random order based on priority
  let mut names = Vec::new();
  for (name, &priority) in queue_config {
    for _ in 0..priority {
      names.push(name.clone());
    }
  }

  use rand::seq::SliceRandom;
  let mut rng = rand::rng();
  names.shuffle(&mut rng);

  let mut seen = std::collections::HashSet::new();
  let mut result = Vec::new();
  for name in names {
    if seen.insert(name.clone()) {
      result.push(name);
    }
    if result.len() == queue_config.len() {
      break;
    }
  }
  result
}

/// 计算任务超时时间
/// Calculate task timeout
fn calculate_task_timeout(task_msg: &TaskMessage) -> Duration {
  if task_msg.timeout > 0 {
    return Duration::from_secs(task_msg.timeout as u64);
  }

  // 截止时间已过则立即超时
  // An elapsed deadline times out immediately
  if task_msg.deadline > 0 {
    let remaining = task_msg.deadline - chrono::Utc::now().timestamp();
    return Duration::from_secs(remaining.max(0) as u64);
  }

  DEFAULT_TIMEOUT
}
