use std::path::PathBuf;

use directories::ProjectDirs;
use tracing::subscriber::set_global_default;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    /// One JSON object per line on stderr, for scripted runs
    Json,
}

fn log_dir() -> PathBuf {
    ProjectDirs::from("com", "timepatch", "timepatch")
        .map(|d| d.data_local_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// Install the global subscriber: console on stderr plus a daily log file.
///
/// `RUST_LOG` wins over `env_filter` when set. Keep the returned guard alive
/// until exit so the file writer flushes.
pub fn init_subscriber(
    name: &str,
    env_filter: &str,
    format: LogFormat,
) -> Result<WorkerGuard, Box<dyn std::error::Error + Send + Sync>> {
    LogTracer::init()?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    let console_layer = match format {
        LogFormat::Pretty => fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let file_appender = tracing_appender::rolling::daily(log_dir(), format!("{}.log", name));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().with_ansi(false).with_writer(non_blocking);

    let subscriber = Registry::default()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer);

    set_global_default(subscriber)?;

    Ok(guard)
}
