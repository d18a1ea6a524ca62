//! # jobq-worker
//!
//! 消费 `llm:process` 任务：读取任务指向的记录，通过断路器调用聊天补全 API 生成报告，
//! 保存结果并通知可选的回调地址。
//! Consumes `llm:process` jobs: loads the referenced record, asks a
//! chat-completion API for a report through a circuit breaker, stores the
//! outcome and notifies an optional callback URL.
//!
//! 投递语义为至少一次。记录已完成的重复任务会直接确认，不再调用 API。
//! Delivery is at-least-once. Redelivered jobs whose record is already
//! completed are acknowledged without calling the API again.

pub mod breaker;
pub mod callback;
pub mod completion;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod payload;
pub mod settings;
pub mod store;
pub mod url_guard;
pub mod worker;
