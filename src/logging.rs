//! Tracing setup: daily-rolling log file, optional stderr mirror.

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the filter directives.
pub const LOG_ENV: &str = "SCENTSHELF_LOG";
const DEFAULT_FILTER: &str = "scentshelf=info";

/// Default log directory: {data_dir}/scentshelf/logs
pub fn default_log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|d| d.join("scentshelf").join("logs"))
}

/// Install the global subscriber. Keep the returned guard alive until exit
/// so buffered lines are flushed.
pub fn init(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

  let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "scentshelf.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(filter)
    .with(
      fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(writer),
    )
    .with(verbose.then(|| fmt::layer().with_target(true).with_writer(std::io::stderr)))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

  Ok(guard)
}
