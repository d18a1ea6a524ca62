//! Redis 存储后端
//! Redis storage backend
//!
//! 键布局与 Go asynq 保持一致，Go 生产者入队的任务可以直接被消费
//! The key layout matches Go asynq, so tasks enqueued by Go producers can be consumed directly

mod broker;
pub mod redis_broker;
mod redis_scripts;

pub use redis_broker::RedisBroker;
