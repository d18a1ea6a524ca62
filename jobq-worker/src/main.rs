//! jobq-worker 可执行文件
//! jobq-worker binary
//!
//! 运行 `llm:process` 工作者，直到收到 SIGINT 或 SIGTERM
//! Runs the `llm:process` worker until SIGINT or SIGTERM

use clap::Parser;
use jobq::components::ComponentLifecycle;
use jobq_worker::settings::{mask_dsn, mask_secret, Settings};
use jobq_worker::store::{RecordStore, SqlRecordStore};
use jobq_worker::url_guard::UrlGuard;
use jobq_worker::{logging, worker};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "jobq-worker", version, about = "Process queued LLM report jobs")]
struct Cli {
  /// TOML 配置文件路径
  /// Path to the TOML configuration file
  #[arg(long, default_value = "config/worker.toml")]
  config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();
  let settings = Settings::load(&cli.config)?;
  logging::init(&settings.logger)?;

  info!(
    app = %settings.app.name,
    mode = %settings.app.mode,
    config_file = %cli.config.display(),
    "Worker starting"
  );

  info!(dsn = %mask_dsn(&settings.database.url), "Connecting to database");
  let guard = UrlGuard::new();
  let store = SqlRecordStore::connect(
    &settings.database.url,
    settings.database.max_connections,
    guard.clone(),
  )
  .await?;
  store.ping().await?;
  info!("Database connected successfully");

  info!(
    base_url = %settings.completion.base_url,
    model = %settings.completion.model,
    api_key = mask_secret(&settings.completion.api_key),
    "Completion API configured"
  );
  let handler = worker::build_handler(&settings, Arc::new(store), guard)?;

  info!(
    concurrency = settings.queue.concurrency,
    redis = %settings.redis.addr,
    "Creating worker"
  );
  let mut server = worker::connect_server(&settings.redis, &settings.queue).await?;
  let monitor = Arc::new(worker::connect_queue_monitor(&settings.redis).await?);
  let monitor_handle = monitor.clone().start();

  info!("Starting worker...");
  let result = server.run(worker::routes(handler)).await;
  monitor.shutdown();
  let _ = monitor_handle.await;
  result?;
  info!("Worker stopped");
  Ok(())
}
