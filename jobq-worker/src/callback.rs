//! 回调模块
//! Callback module
//!
//! 将完成的报告通过 webhook 投递给记录上的回调地址
//! Webhook delivery of completed reports to the record's callback URL

use crate::metrics;
use crate::url_guard::{UrlGuard, UrlRejection};
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// 回调投递错误，只报告给调用方，从不影响任务结果
/// Callback delivery error, reported to the caller only and never affects the job
#[derive(Debug, Error)]
pub enum CallbackError {
  #[error("callback URL validation failed: {0}")]
  Rejected(#[from] UrlRejection),

  #[error("failed to send callback request: {0}")]
  Transport(#[source] reqwest::Error),

  #[error("callback request failed with status: {0}")]
  Status(u16),
}

/// POST 到回调地址的请求体
/// Body POSTed to the callback URL
#[derive(Debug, Serialize)]
pub struct CallbackBody<'a> {
  pub result: &'a str,
  pub status: &'static str,
  /// Unix 秒
  /// Unix seconds
  pub timestamp: i64,
}

/// 回调投递器，与补全客户端共享 HTTP 连接池
/// Callback notifier, shares the HTTP pool with the completion client
#[derive(Clone)]
pub struct CallbackNotifier {
  http: reqwest::Client,
  guard: UrlGuard,
}

impl CallbackNotifier {
  pub fn new(http: reqwest::Client, guard: UrlGuard) -> Self {
    Self { http, guard }
  }

  /// 投递一次。先重新校验地址，因为 DNS 可能在保存之后发生了变化
  /// Make one delivery attempt. The URL is checked again first since DNS may
  /// have changed since it was stored
  pub async fn deliver(&self, url: &str, result: &str) -> Result<(), CallbackError> {
    let outcome = self.send(url, result).await;
    metrics::record_callback(if outcome.is_ok() { "success" } else { "error" });
    outcome
  }

  async fn send(&self, url: &str, result: &str) -> Result<(), CallbackError> {
    self.guard.validate(url).await?;

    let body = CallbackBody {
      result,
      status: "success",
      timestamp: chrono::Utc::now().timestamp(),
    };
    let response = self
      .http
      .post(url)
      .json(&body)
      .send()
      .await
      .map_err(CallbackError::Transport)?;

    if response.status() != StatusCode::OK {
      return Err(CallbackError::Status(response.status().as_u16()));
    }
    Ok(())
  }
}
