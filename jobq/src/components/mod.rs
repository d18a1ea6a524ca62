//! 后台组件模块
//! Background components module
//!
//! 定义了统一的生命周期接口，用于管理后台组件（Forwarder、Recoverer、Heartbeat）
//! Defines a unified lifecycle interface for managing background components (Forwarder, Recoverer, Heartbeat)

use std::sync::Arc;
use tokio::task::JoinHandle;

pub mod forwarder;
pub mod heartbeat;
pub mod processor;
pub mod recoverer;

/// 组件生命周期管理接口
/// Component lifecycle management interface
///
/// [`Processor`](processor::Processor) 没有实现此 trait：它需要泛型 Handler 参数，且关闭是异步的
/// [`Processor`](processor::Processor) does not implement this trait: it needs a generic Handler
/// parameter and its shutdown is async
pub trait ComponentLifecycle {
  /// 启动组件的后台任务
  /// Start the component's background task
  fn start(self: Arc<Self>) -> JoinHandle<()>;

  /// 发送关闭信号，组件会在完成当前操作后停止
  /// Send a shutdown signal, the component stops after its current operation
  fn shutdown(&self);

  /// 组件是否已停止
  /// Whether the component has stopped
  fn is_done(&self) -> bool;
}
