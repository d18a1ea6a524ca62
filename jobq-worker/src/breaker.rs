//! 断路器模块
//! Circuit breaker module
//!
//! 保护补全 API 的断路器。计数按代划分：关闭状态每隔 `interval` 开始新的一代，
//! 每次状态变化也会开始新的一代。在其所属代结束后才完成的调用结果会被忽略。
//! Circuit breaker guarding the completion API. Counts live in generations: a
//! closed breaker starts a new generation every `interval`, and every state change
//! starts one as well. Outcomes that finish after their generation ended are ignored.

use crate::metrics;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// 断路器状态
/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
  Closed,
  HalfOpen,
  Open,
}

impl fmt::Display for BreakerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      BreakerState::Closed => "closed",
      BreakerState::HalfOpen => "half-open",
      BreakerState::Open => "open",
    })
  }
}

/// 当前代内的请求结果
/// Request outcomes within the current generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
  pub requests: u32,
  pub total_successes: u32,
  pub total_failures: u32,
  pub consecutive_successes: u32,
  pub consecutive_failures: u32,
}

impl Counts {
  fn on_request(&mut self) {
    self.requests = self.requests.saturating_add(1);
  }

  fn on_success(&mut self) {
    self.total_successes = self.total_successes.saturating_add(1);
    self.consecutive_successes = self.consecutive_successes.saturating_add(1);
    self.consecutive_failures = 0;
  }

  fn on_failure(&mut self) {
    self.total_failures = self.total_failures.saturating_add(1);
    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    self.consecutive_successes = 0;
  }

  /// 本代的失败率，没有记录时为 0
  /// Failure ratio of the generation, 0 when nothing was recorded
  pub fn failure_ratio(&self) -> f64 {
    if self.requests == 0 {
      return 0.0;
    }
    f64::from(self.total_failures) / f64::from(self.requests)
  }
}

/// 断路器配置
/// Breaker configuration
#[derive(Debug, Clone)]
pub struct BreakerConfig {
  pub name: String,
  /// 半开状态允许的试探调用数，也是关闭所需的连续成功数
  /// Trial calls allowed while half-open, and successes needed to close
  pub max_requests: u32,
  /// 关闭状态的计数窗口长度
  /// Length of a closed-state counting window
  pub interval: Duration,
  /// 打开状态持续多久后允许试探
  /// How long the breaker stays open before allowing trials
  pub timeout: Duration,
  /// 触发断路的失败率，取值 (0, 1]
  /// Failure ratio in (0, 1] that trips the breaker
  pub fail_threshold: f64,
  /// 计算失败率前窗口内至少需要的请求数
  /// Minimum requests in the window before the ratio is considered
  pub min_requests: u32,
}

impl Default for BreakerConfig {
  fn default() -> Self {
    Self {
      name: "llm-api".to_string(),
      max_requests: 2,
      interval: Duration::from_secs(60),
      timeout: Duration::from_secs(120),
      fail_threshold: 0.5,
      min_requests: 5,
    }
  }
}

impl BreakerConfig {
  pub fn name<S: Into<String>>(mut self, name: S) -> Self {
    self.name = name.into();
    self
  }

  pub fn max_requests(mut self, max_requests: u32) -> Self {
    self.max_requests = max_requests;
    self
  }

  pub fn interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn fail_threshold(mut self, fail_threshold: f64) -> Self {
    self.fail_threshold = fail_threshold;
    self
  }

  pub fn min_requests(mut self, min_requests: u32) -> Self {
    self.min_requests = min_requests;
    self
  }

  fn ready_to_trip(&self, counts: &Counts) -> bool {
    counts.requests >= self.min_requests && counts.failure_ratio() >= self.fail_threshold
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BreakerError<E> {
  /// 断路器已打开，调用未执行
  /// The breaker is open; the call was not attempted
  #[error("circuit breaker is open")]
  Open,

  /// 半开且试探名额已满，调用未执行
  /// Half-open and all trial slots are taken; the call was not attempted
  #[error("circuit breaker is half-open and at its trial limit")]
  TooManyRequests,

  #[error(transparent)]
  Inner(E),
}

impl<E> BreakerError<E> {
  /// 调用是否在未执行的情况下被拒绝
  /// Whether the call was refused without running
  pub fn is_rejection(&self) -> bool {
    !matches!(self, BreakerError::Inner(_))
  }
}

#[derive(Debug)]
struct Inner {
  state: BreakerState,
  generation: u64,
  counts: Counts,
  expiry: Option<Instant>,
}

/// 断路器，内部同步，可在工作者之间共享
/// Circuit breaker, synchronised internally and shared across workers
#[derive(Debug)]
pub struct CircuitBreaker {
  config: BreakerConfig,
  inner: Mutex<Inner>,
}

impl CircuitBreaker {
  pub fn new(config: BreakerConfig) -> Self {
    let expiry = (!config.interval.is_zero()).then(|| Instant::now() + config.interval);
    Self {
      config,
      inner: Mutex::new(Inner {
        state: BreakerState::Closed,
        generation: 0,
        counts: Counts::default(),
        expiry,
      }),
    }
  }

  pub fn name(&self) -> &str {
    &self.config.name
  }

  pub fn state(&self) -> BreakerState {
    let mut inner = self.lock();
    self.current_state(&mut inner, Instant::now());
    inner.state
  }

  pub fn counts(&self) -> Counts {
    let mut inner = self.lock();
    self.current_state(&mut inner, Instant::now());
    inner.counts
  }

  /// 除非被断路器拒绝，否则执行 `call` 并记录结果
  /// Run `call` unless the breaker refuses it, recording the outcome
  ///
  /// 完成前被丢弃的调用计为失败
  /// A call dropped before completion counts as a failure
  pub async fn execute<F, T, E>(&self, call: F) -> Result<T, BreakerError<E>>
  where
    F: Future<Output = Result<T, E>>,
  {
    let generation = self.before_request()?;
    let mut pending = PendingCall {
      breaker: self,
      generation,
      finished: false,
    };

    let result = call.await;
    pending.finished = true;
    self.after_request(generation, result.is_ok());
    result.map_err(BreakerError::Inner)
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn before_request<E>(&self) -> Result<u64, BreakerError<E>> {
    let mut inner = self.lock();
    self.current_state(&mut inner, Instant::now());

    match inner.state {
      BreakerState::Open => return Err(BreakerError::Open),
      BreakerState::HalfOpen if inner.counts.requests >= self.config.max_requests => {
        return Err(BreakerError::TooManyRequests)
      }
      _ => {}
    }

    inner.counts.on_request();
    Ok(inner.generation)
  }

  fn after_request(&self, before: u64, success: bool) {
    let mut inner = self.lock();
    let now = Instant::now();
    self.current_state(&mut inner, now);
    if inner.generation != before {
      return;
    }

    match (inner.state, success) {
      (BreakerState::Closed, true) => inner.counts.on_success(),
      (BreakerState::HalfOpen, true) => {
        inner.counts.on_success();
        if inner.counts.consecutive_successes >= self.config.max_requests {
          self.set_state(&mut inner, BreakerState::Closed, now);
        }
      }
      (BreakerState::Closed, false) => {
        inner.counts.on_failure();
        if self.config.ready_to_trip(&inner.counts) {
          self.set_state(&mut inner, BreakerState::Open, now);
        }
      }
      (BreakerState::HalfOpen, false) => self.set_state(&mut inner, BreakerState::Open, now),
      (BreakerState::Open, _) => {}
    }
  }

  fn current_state(&self, inner: &mut Inner, now: Instant) {
    let expired = inner.expiry.is_some_and(|expiry| expiry <= now);
    match inner.state {
      BreakerState::Closed if expired => self.new_generation(inner, now),
      BreakerState::Open if expired => self.set_state(inner, BreakerState::HalfOpen, now),
      _ => {}
    }
  }

  fn set_state(&self, inner: &mut Inner, state: BreakerState, now: Instant) {
    if inner.state == state {
      return;
    }
    let from = inner.state;
    let counts = inner.counts;
    inner.state = state;
    self.new_generation(inner, now);
    metrics::record_breaker_transition(&self.config.name, from, state);

    match state {
      BreakerState::Open => tracing::warn!(
        breaker = %self.config.name,
        from = %from,
        to = %state,
        requests = counts.requests,
        failures = counts.total_failures,
        "circuit breaker opened"
      ),
      _ => tracing::info!(
        breaker = %self.config.name,
        from = %from,
        to = %state,
        "circuit breaker state changed"
      ),
    }
  }

  fn new_generation(&self, inner: &mut Inner, now: Instant) {
    inner.generation = inner.generation.wrapping_add(1);
    inner.counts = Counts::default();
    inner.expiry = match inner.state {
      BreakerState::Closed => (!self.config.interval.is_zero()).then(|| now + self.config.interval),
      BreakerState::Open => Some(now + self.config.timeout),
      BreakerState::HalfOpen => None,
    };
  }
}

struct PendingCall<'a> {
  breaker: &'a CircuitBreaker,
  generation: u64,
  finished: bool,
}

impl Drop for PendingCall<'_> {
  fn drop(&mut self) {
    if !self.finished {
      self.breaker.after_request(self.generation, false);
    }
  }
}
