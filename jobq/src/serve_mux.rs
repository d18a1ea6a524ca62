//! ServeMux - 任务路由多路复用器
//! ServeMux - Task routing multiplexer
//!
//! 根据任务类型把任务分发给注册的处理器
//! Dispatches tasks to registered handlers by task type
//!
//! ## 模式匹配 / Pattern matching
//!
//! - 精确匹配 / Exact match: `"llm:process"` matches only "llm:process"
//! - 前缀通配符 / Prefix wildcard: `"llm:*"` matches every type starting with "llm:"
//! - 后缀通配符 / Suffix wildcard: `"*:process"` matches every type ending with ":process"
//! - 捕获所有 / Catch-all: `"*"` matches any task type
//!
//! 精确匹配优先；多个通配符同时匹配时，最长的模式优先
//! Exact matches win; among matching wildcards the longest pattern wins
//!
//! ```rust,no_run
//! use jobq::{serve_mux::ServeMux, task::Task};
//!
//! let mut mux = ServeMux::new();
//! mux.handle_func("llm:*", |task: Task| {
//!   println!("processing {}", task.get_type());
//!   Ok(())
//! });
//! mux.handle_async_func("*", |task: Task| async move {
//!   println!("fallback for {}", task.get_type());
//!   Ok(())
//! });
//! ```

use crate::error::{Error, Result};
use crate::server::Handler;
use crate::task::Task;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// 处理器包装器
/// Handler wrapper
enum HandlerWrapper {
  Sync(Arc<dyn Fn(Task) -> Result<()> + Send + Sync>),
  Async(Arc<dyn Fn(Task) -> BoxFuture<Result<()>> + Send + Sync>),
  Handler(Arc<dyn Handler>),
}

/// 检查任务类型是否匹配模式
/// Check if a task type matches a pattern
fn pattern_matches(pattern: &str, task_type: &str) -> bool {
  match pattern.split_once('*') {
    None => pattern == task_type,
    Some((prefix, rest)) => {
      if !task_type.starts_with(prefix) {
        return false;
      }
      let mut remaining = &task_type[prefix.len()..];
      let mut parts = rest.split('*').peekable();
      while let Some(part) = parts.next() {
        if parts.peek().is_none() {
          // 最后一段必须是后缀
          // The last part must be a suffix
          return remaining.ends_with(part);
        }
        match remaining.find(part) {
          Some(pos) => remaining = &remaining[pos + part.len()..],
          None => return false,
        }
      }
      true
    }
  }
}

/// ServeMux - 任务路由多路复用器
/// ServeMux - Task routing multiplexer
#[derive(Default)]
pub struct ServeMux {
  handlers: HashMap<String, HandlerWrapper>,
}

impl ServeMux {
  /// 创建新的 ServeMux
  /// Create a new ServeMux
  pub fn new() -> Self {
    Self::default()
  }

  /// 注册实现了 [`Handler`] 的处理器
  /// Register a value implementing [`Handler`]
  pub fn handle<H>(&mut self, pattern: &str, handler: H)
  where
    H: Handler + 'static,
  {
    self.handlers.insert(
      pattern.to_string(),
      HandlerWrapper::Handler(Arc::new(handler)),
    );
  }

  /// 注册同步处理函数
  /// Register a synchronous handler function
  pub fn handle_func<F>(&mut self, pattern: &str, func: F)
  where
    F: Fn(Task) -> Result<()> + Send + Sync + 'static,
  {
    self
      .handlers
      .insert(pattern.to_string(), HandlerWrapper::Sync(Arc::new(func)));
  }

  /// 注册异步处理函数
  /// Register an asynchronous handler function
  pub fn handle_async_func<F, Fut>(&mut self, pattern: &str, func: F)
  where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    let func = Arc::new(func);
    self.handlers.insert(
      pattern.to_string(),
      HandlerWrapper::Async(Arc::new(move |task: Task| {
        let func = Arc::clone(&func);
        Box::pin(async move { func(task).await })
      })),
    );
  }

  /// 已注册的模式数量
  /// Number of registered patterns
  pub fn len(&self) -> usize {
    self.handlers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.handlers.is_empty()
  }

  fn find_handler(&self, task_type: &str) -> Option<&HandlerWrapper> {
    if let Some(handler) = self.handlers.get(task_type) {
      return Some(handler);
    }

    self
      .handlers
      .iter()
      .filter(|(pattern, _)| pattern_matches(pattern, task_type))
      .max_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| b.cmp(a)))
      .map(|(_, handler)| handler)
  }
}

#[async_trait]
impl Handler for ServeMux {
  async fn process_task(&self, task: Task) -> Result<()> {
    match self.find_handler(task.get_type()) {
      Some(HandlerWrapper::Sync(func)) => func(task),
      Some(HandlerWrapper::Async(func)) => func(task).await,
      Some(HandlerWrapper::Handler(handler)) => handler.process_task(task).await,
      None => Err(Error::HandlerNotFound {
        task_type: task.get_type().to_string(),
      }),
    }
  }
}
