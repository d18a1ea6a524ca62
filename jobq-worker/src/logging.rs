use crate::settings::LoggerSettings;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装进程级订阅器；`RUST_LOG` 优先于配置的日志级别
/// Install the process-wide subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init(settings: &LoggerSettings) -> Result<(), TryInitError> {
  let filter = filter(settings);
  let registry = tracing_subscriber::registry().with(filter);
  if settings.development {
    registry.with(fmt::layer().with_target(true)).try_init()
  } else {
    registry
      .with(fmt::layer().json().flatten_event(true))
      .try_init()
  }
}

fn filter(settings: &LoggerSettings) -> EnvFilter {
  EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level))
}
