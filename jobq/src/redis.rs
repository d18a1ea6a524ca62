//! Redis 配置和连接管理模块
//! Redis configuration and connection management module

use crate::error::Result;
use redis::{ConnectionInfo, IntoConnectionInfo};

/// Redis 连接配置
/// Redis connection configuration
#[derive(Debug, Clone)]
pub enum RedisConnectionConfig {
  /// 单机连接
  /// Standalone connection
  Single(ConnectionInfo),
}

impl RedisConnectionConfig {
  /// 创建单机连接
  /// Create a standalone connection
  pub fn single<T: IntoConnectionInfo>(connection_info: T) -> Result<Self> {
    Ok(Self::Single(connection_info.into_connection_info()?))
  }

  /// 由地址、密码和数据库编号创建单机连接
  /// Create a standalone connection from address, password and database number
  pub fn from_parts(addr: &str, password: Option<&str>, db: i64) -> Result<Self> {
    let url = match password.filter(|p| !p.is_empty()) {
      Some(password) => format!("redis://:{password}@{addr}/{db}"),
      None => format!("redis://{addr}/{db}"),
    };
    Self::single(url.as_str())
  }

  pub(crate) fn connection_info(&self) -> &ConnectionInfo {
    match self {
      Self::Single(info) => info,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_single_from_url() {
    let config = RedisConnectionConfig::single("redis://localhost:6379/2").unwrap();
    assert_eq!(config.connection_info().redis.db, 2);
  }

  #[test]
  fn test_from_parts_with_password() {
    let config = RedisConnectionConfig::from_parts("127.0.0.1:6380", Some("secret"), 1).unwrap();
    let info = config.connection_info();
    assert_eq!(info.redis.db, 1);
    assert_eq!(info.redis.password.as_deref(), Some("secret"));
  }

  #[test]
  fn test_from_parts_without_password() {
    let config = RedisConnectionConfig::from_parts("127.0.0.1:6379", Some(""), 0).unwrap();
    assert!(config.connection_info().redis.password.is_none());
  }
}
