//! Global `tracing` subscriber for the voice client
//!
//! stdout belongs to the interactive room view, so log lines go to stderr
//! unless `logging.file_path` redirects them.

use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::Context;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Install the subscriber described by `config`.
///
/// `RUST_LOG` overrides `config.level` when set. Fails if a subscriber is
/// already installed or the log file cannot be opened.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => configured_filter(&config.level)?,
    };

    let writer = match &config.file_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {path}"))?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true)
                    .with_line_number(true)
                    .with_writer(writer),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_line_number(true)
                    .with_file(false)
                    .with_writer(writer),
            )
            .try_init()?;
    }
    Ok(())
}

/// A bare level (`warning` is accepted for `warn`) or a full filter
/// directive such as `roomvoice_core=debug,webrtc=warn`
fn configured_filter(level: &str) -> anyhow::Result<EnvFilter> {
    if let Some(level) = bare_level(level) {
        return Ok(EnvFilter::new(level.to_string()));
    }
    EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))
}

fn bare_level(level: &str) -> Option<Level> {
    Some(match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => return None,
    })
}
