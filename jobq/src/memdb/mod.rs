//! 内存存储后端
//! In-memory storage backend
//!
//! 不依赖任何外部服务，适用于测试和单进程部署
//! No external service dependencies, suitable for tests and single-process deployments

mod broker;
pub mod memory_broker;

pub use memory_broker::MemoryBroker;
