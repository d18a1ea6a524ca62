use std::time::Duration;

/// 默认队列名称
pub const DEFAULT_QUEUE_NAME: &str = "default";

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRY: i32 = 3;
/// 归档集合保留的最大任务数
pub const DEFAULT_MAX_ARCHIVE_SIZE: i64 = 10240;
pub const DEFAULT_ARCHIVED_EXPIRATION_IN_DAYS: i64 = 90;
/// 默认任务超时时间
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60); // 30 分钟

/// 按天统计键的保留天数
pub const STATS_TTL_DAYS: i64 = 90;
/// 活跃任务的租约时长（秒）
pub const LEASE_DURATION_SECS: i64 = 30;

pub const TIME_LAYOUT_YMD: &str = "%Y-%m-%d";
