//! Redis 经纪人实现
//! Redis broker implementation

use crate::error::Result;
use crate::redis::RedisConnectionConfig;
use redis::aio::MultiplexedConnection;
use redis::Client;

/// Redis 经纪人
/// Redis broker
///
/// 持有一个多路复用连接，各操作克隆后并发使用
/// Holds one multiplexed connection, cloned per operation for concurrent use
pub struct RedisBroker {
  conn: MultiplexedConnection,
}

impl RedisBroker {
  /// 连接 Redis 并创建经纪人实例
  /// Connect to Redis and create a broker instance
  pub async fn new(config: RedisConnectionConfig) -> Result<Self> {
    let client = Client::open(config.connection_info().clone())?;
    let conn = client.get_multiplexed_async_connection().await?;
    tracing::debug!("Connected to Redis at {}", config.connection_info().addr);
    Ok(Self { conn })
  }

  /// 获取连接的克隆
  /// Get a clone of the connection
  pub(crate) fn connection(&self) -> MultiplexedConnection {
    self.conn.clone()
  }
}
