//! Logging for CLI commands and the daemon

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use trawl::RuntimeConfig;

const LOG_FILE: &str = "trawl.log";

/// Initialize logging for CLI commands (console only)
pub fn init_cli_logging() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
    .with_target(false)
    .init();
}

/// Parse log level from config string
fn parse_log_level(level: &str) -> tracing::level_filters::LevelFilter {
  use tracing::level_filters::LevelFilter;

  match level.to_lowercase().as_str() {
    "off" => LevelFilter::OFF,
    "error" => LevelFilter::ERROR,
    "warn" => LevelFilter::WARN,
    "debug" => LevelFilter::DEBUG,
    "trace" => LevelFilter::TRACE,
    _ => LevelFilter::INFO,
  }
}

/// Initialize logging for the daemon from `daemon.log_level` and
/// `daemon.log_rotation`.
///
/// In foreground mode: Logs to console only with colors
/// In background mode: Logs to file only (no ANSI)
///
/// Returns the guard that must be kept alive for the duration of the program
pub fn init_daemon_logging(runtime: &RuntimeConfig) -> Option<WorkerGuard> {
  let daemon_config = &runtime.config.daemon;

  // RUST_LOG overrides the configured level
  let env_filter = EnvFilter::builder()
    .with_default_directive(parse_log_level(&daemon_config.log_level).into())
    .from_env_lossy();

  if runtime.foreground {
    tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_target(true)
      .with_ansi(true)
      .init();
    return None;
  }

  let log_dir = &runtime.data_dir;
  if std::fs::create_dir_all(log_dir).is_err() {
    // Fall back to console-only logging
    init_cli_logging();
    return None;
  }

  let file_appender = match daemon_config.log_rotation.as_str() {
    "hourly" => tracing_appender::rolling::hourly(log_dir, LOG_FILE),
    "never" => tracing_appender::rolling::never(log_dir, LOG_FILE),
    _ => tracing_appender::rolling::daily(log_dir, LOG_FILE),
  };
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_target(true)
    .with_ansi(false)
    .with_writer(file_writer)
    .init();

  Some(guard)
}

#[cfg(test)]
mod tests {
  use tracing::level_filters::LevelFilter;

  use super::*;

  #[test]
  fn test_parse_log_level() {
    assert_eq!(parse_log_level("DEBUG"), LevelFilter::DEBUG);
    assert_eq!(parse_log_level("off"), LevelFilter::OFF);
    assert_eq!(parse_log_level("loud"), LevelFilter::INFO);
  }
}
