use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Keeps the background log writers alive; logs stop flushing once dropped.
pub struct LogGuards {
    _text: WorkerGuard,
    _events: WorkerGuard,
}

fn daily_appender(path: &Path) -> Result<RollingFileAppender> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("log path {} has no parent directory", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("log path {} has no file name", path.display()))?;
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(name)
        .build(dir)
        .with_context(|| format!("opening {}", path.display()))
}

/// Install the global subscriber.
///
/// - `log_level` is an `EnvFilter` directive (e.g. `"info"` or `"chatflow=debug"`).
/// - `log_file` (relative to `root`) gets the daily plain-text log.
/// - `event_file` (relative to `root`) gets one JSON line per `target: "request"` event.
///
/// Warnings and errors are also printed to stderr.
pub fn init_tracing(root: &Path, log_file: &str, event_file: &str, log_level: &str) -> Result<LogGuards> {
    let log_path: PathBuf = root.join(log_file);
    let event_path: PathBuf = root.join(event_file);

    let (text_writer, text_guard) = tracing_appender::non_blocking(daily_appender(&log_path)?);
    let (event_writer, event_guard) = tracing_appender::non_blocking(daily_appender(&event_path)?);

    let text_layer = fmt::layer()
        .with_writer(text_writer)
        .with_ansi(false)
        .with_filter(EnvFilter::new(log_level));

    let json_layer = fmt::layer()
        .json()
        .with_writer(event_writer)
        .with_target(true)
        .with_filter(EnvFilter::new("request=info"));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new("warn"));

    Registry::default()
        .with(text_layer)
        .with(json_layer)
        .with(console_layer)
        .try_init()
        .context("a tracing subscriber is already installed")?;

    Ok(LogGuards {
        _text: text_guard,
        _events: event_guard,
    })
}
