//! # jobq
//!
//! 基于 Redis 的后台任务运行时，兼容 asynq 的线上消息格式
//! A Redis-backed background job runtime, compatible with the asynq wire format
//!
//! 提供至少一次投递、按任务计数的重试、可配置并发、线性/指数退避以及重试耗尽后的归档。
//! Provides at-least-once delivery, per-task retry counters, configurable concurrency,
//! linear/exponential backoff, and archival once retries are exhausted.
//!
//! ## 快速开始 / Quick start
//!
//! ```rust,no_run
//! use jobq::client::Client;
//! use jobq::memdb::MemoryBroker;
//! use jobq::serve_mux::ServeMux;
//! use jobq::server::{Server, ServerConfig};
//! use jobq::task::Task;
//! use std::sync::Arc;
//!
//! # async fn example() -> jobq::error::Result<()> {
//! let broker = Arc::new(MemoryBroker::new());
//! let client = Client::with_broker(broker.clone());
//! client.enqueue(Task::new("email:send", b"hello")?).await?;
//!
//! let mut mux = ServeMux::new();
//! mux.handle_func("email:send", |task: Task| {
//!   println!("sending {:?}", task.get_payload());
//!   Ok(())
//! });
//!
//! let mut server = Server::with_broker(broker, ServerConfig::default())?;
//! server.run(mux).await?;
//! # Ok(())
//! # }
//! ```

pub mod base;
pub mod client;
pub mod components;
pub mod config;
pub mod error;
pub mod memdb;
pub mod proto;
pub mod rdb;
pub mod redis;
pub mod serve_mux;
pub mod server;
pub mod task;
