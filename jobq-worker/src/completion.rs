//! 补全客户端模块
//! Completion client module
//!
//! 受进程级断路器保护的聊天补全客户端
//! Chat-completion client guarded by the process-wide circuit breaker

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::metrics::{self, MetricsTimer};
use reqwest::{redirect, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// 补全 API 配置
/// Completion API configuration
#[derive(Clone)]
pub struct CompletionConfig {
  /// 完整的接口地址，请求原样 POST 到这里
  /// Full endpoint URL; requests are POSTed here as-is
  pub base_url: String,
  pub api_key: String,
  pub model: String,
  pub max_tokens: u32,
  pub timeout: Duration,
}

impl fmt::Debug for CompletionConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionConfig")
      .field("base_url", &self.base_url)
      .field("api_key", &"[MASKED]")
      .field("model", &self.model)
      .field("max_tokens", &self.max_tokens)
      .field("timeout", &self.timeout)
      .finish()
  }
}

/// 补全调用错误，断路器拒绝与下游失败可区分
/// Completion call error; breaker refusals are distinct from downstream failures
#[derive(Debug, Error)]
pub enum CompletionError {
  #[error("service temporarily unavailable: circuit breaker is open")]
  CircuitOpen,

  #[error("LLM API request timed out")]
  Timeout,

  #[error("failed to send LLM API request: {0}")]
  Transport(#[source] reqwest::Error),

  #[error("LLM API request failed with status: {status}, body: {body}")]
  Status { status: u16, body: String },

  #[error("failed to decode LLM API response: {0}")]
  Decode(String),

  #[error("empty response from LLM API")]
  EmptyResponse,
}

impl CompletionError {
  /// 调用被断路器拒绝，而不是在下游失败
  /// The call was refused by the breaker rather than failing downstream
  pub fn is_circuit_open(&self) -> bool {
    matches!(self, CompletionError::CircuitOpen)
  }

  /// 指标中使用的状态标签
  /// Status label used in metrics
  pub fn metric_label(&self) -> &'static str {
    match self {
      CompletionError::CircuitOpen => "circuit_open",
      CompletionError::Timeout | CompletionError::Transport(_) => "network_error",
      CompletionError::Status { .. } => "status_error",
      CompletionError::Decode(_) => "decode_error",
      CompletionError::EmptyResponse => "empty_response",
    }
  }

  fn from_reqwest(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      CompletionError::Timeout
    } else {
      CompletionError::Transport(err)
    }
  }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
  role: &'static str,
  content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
  model: &'a str,
  messages: [ChatMessage<'a>; 2],
  max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
  #[serde(default)]
  choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
  message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
  #[serde(default)]
  content: Option<String>,
}

/// 聊天补全客户端
/// Chat-completion client
pub struct CompletionClient {
  http: reqwest::Client,
  config: CompletionConfig,
  breaker: Arc<CircuitBreaker>,
}

impl CompletionClient {
  /// 使用自己的带超时 HTTP 连接池创建客户端
  /// Build a client with its own timeout-bounded HTTP pool
  pub fn new(config: CompletionConfig, breaker: Arc<CircuitBreaker>) -> Result<Self, reqwest::Error> {
    let http = http_client(config.timeout)?;
    Ok(Self::with_http(http, config, breaker))
  }

  pub fn with_http(
    http: reqwest::Client,
    config: CompletionConfig,
    breaker: Arc<CircuitBreaker>,
  ) -> Self {
    Self {
      http,
      config,
      breaker,
    }
  }

  /// 底层 HTTP 客户端，与回调投递共享
  /// The underlying HTTP client, shared with callback delivery
  pub fn http_client(&self) -> reqwest::Client {
    self.http.clone()
  }

  pub fn breaker(&self) -> &Arc<CircuitBreaker> {
    &self.breaker
  }

  /// 让模型在 `system` 提示下回答 `user`
  /// Ask the model to answer `user` under the `system` prompt
  ///
  /// 丢弃返回的 future 会中止请求
  /// Dropping the returned future aborts the request
  pub async fn complete(&self, system: &str, user: &str) -> Result<String, CompletionError> {
    let timer = MetricsTimer::start();
    let result = match self.breaker.execute(self.send(system, user)).await {
      Ok(content) => Ok(content),
      Err(BreakerError::Inner(err)) => Err(err),
      Err(rejection) => {
        tracing::debug!(
          "completion call refused by breaker {}: {}",
          self.breaker.name(),
          rejection
        );
        Err(CompletionError::CircuitOpen)
      }
    };
    let status = match &result {
      Ok(_) => "success",
      Err(err) => err.metric_label(),
    };
    metrics::record_llm_call(status, timer.elapsed());
    result
  }

  async fn send(&self, system: &str, user: &str) -> Result<String, CompletionError> {
    let request = ChatRequest {
      model: &self.config.model,
      messages: [
        ChatMessage {
          role: "system",
          content: system,
        },
        ChatMessage {
          role: "user",
          content: user,
        },
      ],
      max_tokens: self.config.max_tokens,
    };

    let response = self
      .http
      .post(&self.config.base_url)
      .bearer_auth(&self.config.api_key)
      .json(&request)
      .send()
      .await
      .map_err(CompletionError::from_reqwest)?;

    let status = response.status();
    if status != StatusCode::OK {
      let body = response
        .text()
        .await
        .map_err(CompletionError::from_reqwest)?;
      return Err(CompletionError::Status {
        status: status.as_u16(),
        body,
      });
    }

    let bytes = response
      .bytes()
      .await
      .map_err(CompletionError::from_reqwest)?;
    let parsed: ChatResponse =
      serde_json::from_slice(&bytes).map_err(|e| CompletionError::Decode(e.to_string()))?;

    parsed
      .choices
      .into_iter()
      .next()
      .and_then(|choice| choice.message.content)
      .filter(|content| !content.is_empty())
      .ok_or(CompletionError::EmptyResponse)
  }
}

/// 带超时且从不跟随重定向的 HTTP 客户端
/// A timeout-bounded client that never follows redirects
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
  reqwest::Client::builder()
    .timeout(timeout)
    .redirect(redirect::Policy::none())
    .build()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::breaker::{BreakerConfig, BreakerState};
  use serde_json::json;
  use wiremock::matchers::{body_partial_json, header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn client(server: &MockServer, breaker: Arc<CircuitBreaker>) -> CompletionClient {
    let config = CompletionConfig {
      base_url: format!("{}/chat/completions", server.uri()),
      api_key: "sk-test".into(),
      model: "deepseek-chat".into(),
      max_tokens: 256,
      timeout: Duration::from_secs(2),
    };
    CompletionClient::new(config, breaker).unwrap()
  }

  fn breaker() -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(BreakerConfig::default()))
  }

  #[tokio::test]
  async fn test_complete_sends_chat_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .and(header("authorization", "Bearer sk-test"))
      .and(body_partial_json(json!({
        "model": "deepseek-chat",
        "max_tokens": 256,
        "messages": [
          {"role": "system", "content": "be brief"},
          {"role": "user", "content": "value this"}
        ]
      })))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{"message": {"role": "assistant", "content": "worth 42"}}]
      })))
      .expect(1)
      .mount(&server)
      .await;

    let content = client(&server, breaker())
      .complete("be brief", "value this")
      .await
      .unwrap();
    assert_eq!(content, "worth 42");
  }

  #[tokio::test]
  async fn test_non_200_captures_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
      .mount(&server)
      .await;

    let err = client(&server, breaker())
      .complete("s", "u")
      .await
      .unwrap_err();
    assert!(matches!(err, CompletionError::Status { status: 500, .. }));
    assert_eq!(
      err.to_string(),
      "LLM API request failed with status: 500, body: upstream exploded"
    );
  }

  #[tokio::test]
  async fn test_empty_choices_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
      .mount(&server)
      .await;

    let err = client(&server, breaker())
      .complete("s", "u")
      .await
      .unwrap_err();
    assert!(matches!(err, CompletionError::EmptyResponse));
  }

  #[tokio::test]
  async fn test_undecodable_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
      .mount(&server)
      .await;

    let err = client(&server, breaker())
      .complete("s", "u")
      .await
      .unwrap_err();
    assert!(matches!(err, CompletionError::Decode(_)));
  }

  #[tokio::test]
  async fn test_open_breaker_fails_fast() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(503))
      .expect(2)
      .mount(&server)
      .await;

    let breaker = Arc::new(CircuitBreaker::new(
      BreakerConfig::default().min_requests(2).fail_threshold(0.5),
    ));
    let client = client(&server, breaker.clone());
    for _ in 0..2 {
      assert!(matches!(
        client.complete("s", "u").await,
        Err(CompletionError::Status { status: 503, .. })
      ));
    }
    assert_eq!(breaker.state(), BreakerState::Open);

    let err = client.complete("s", "u").await.unwrap_err();
    assert!(err.is_circuit_open());
  }

  #[test]
  fn test_error_metric_labels() {
    assert_eq!(CompletionError::CircuitOpen.metric_label(), "circuit_open");
    assert_eq!(CompletionError::Timeout.metric_label(), "network_error");
    let status = CompletionError::Status {
      status: 502,
      body: String::new(),
    };
    assert_eq!(status.metric_label(), "status_error");
    assert_eq!(
      CompletionError::Decode("eof".into()).metric_label(),
      "decode_error"
    );
    assert_eq!(
      CompletionError::EmptyResponse.metric_label(),
      "empty_response"
    );
  }

  #[test]
  fn test_calls_are_measured_by_status() {
    use crate::metrics::testing::capture;
    use crate::metrics::{LLM_API_CALLS_TOTAL, LLM_API_DURATION_SECONDS};

    let ((), captured) = capture(async {
      let server = MockServer::start().await;
      Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
          "choices": [{"message": {"content": "fine"}}]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
      Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

      let client = client(&server, breaker());
      client.complete("s", "u").await.unwrap();
      client.complete("s", "u").await.unwrap_err();
    });

    assert_eq!(
      captured.counter(LLM_API_CALLS_TOTAL, &[("status", "success")]),
      1
    );
    assert_eq!(
      captured.counter(LLM_API_CALLS_TOTAL, &[("status", "status_error")]),
      1
    );
    assert_eq!(captured.histogram_count(LLM_API_DURATION_SECONDS, &[]), 2);
  }

  #[test]
  fn test_debug_masks_api_key() {
    let config = CompletionConfig {
      base_url: "https://api.example.com".into(),
      api_key: "sk-secret".into(),
      model: "m".into(),
      max_tokens: 1,
      timeout: Duration::from_secs(1),
    };
    assert!(!format!("{:?}", config).contains("sk-secret"));
  }
}
