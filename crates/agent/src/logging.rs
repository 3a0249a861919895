//! Log sink setup.
//!
//! The agent writes two logs: the main log (startup, shutdown, accept
//! failures and everything else) and the request log (one span per
//! connection, from [`crate::request`]). Both go through non-blocking
//! writers whose worker threads live as long as the returned [`LogGuard`].

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::Metadata;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::{filter_fn, EnvFilter};
use tracing_subscriber::{fmt, prelude::*};

use crate::config::LoggingConfig;

/// Target prefix of request-handling events.
pub const REQUEST_TARGET: &str = crate::request::TARGET;

/// Keeps the log writer threads alive. Dropping it flushes and stops them.
#[must_use = "logs are lost once the guard is dropped"]
pub struct LogGuard {
    _guards: Vec<WorkerGuard>,
}

fn is_request_event(metadata: &Metadata<'_>) -> bool {
    metadata.target().starts_with(REQUEST_TARGET)
}

fn open_log(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create log directory: {}", parent.display())
            })?;
        }
    }

    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))
}

/// Builds the non-blocking writer for a sink.
fn writer(path: Option<&Path>, guards: &mut Vec<WorkerGuard>) -> Result<NonBlocking> {
    let (writer, guard) = match path {
        Some(path) => tracing_appender::non_blocking(open_log(path)?),
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    guards.push(guard);
    Ok(writer)
}

/// Install the global subscriber.
///
/// Must be called once, before the listener starts. `RUST_LOG` takes
/// precedence over the configured level.
pub fn init(config: &LoggingConfig) -> Result<LogGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.level.to_lowercase()))
        .context("Invalid log level")?;

    let mut guards = Vec::new();
    let main_writer = writer(config.main_log.as_deref(), &mut guards)?;
    let request_writer = config
        .request_log
        .as_deref()
        .map(|path| writer(Some(path), &mut guards))
        .transpose()?;

    // Request events leave the main log only when they have a sink of their own
    let split = request_writer.is_some();
    let main_layer = fmt::layer()
        .with_writer(main_writer)
        .with_ansi(config.main_log.is_none())
        .with_filter(filter_fn(move |metadata| {
            !split || !is_request_event(metadata)
        }));
    let request_layer = request_writer.map(|request_writer| {
        fmt::layer()
            .with_writer(request_writer)
            .with_ansi(false)
            .with_filter(filter_fn(is_request_event))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(main_layer)
        .with(request_layer)
        .try_init()
        .context("A global logger is already installed")?;

    Ok(LogGuard { _guards: guards })
}
