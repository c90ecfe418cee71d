//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber from the `log` config section
//! - Keep a reload handle so SIGHUP can change the level
//! - Route output to stderr, stdout or nowhere
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level, at startup and on reload
//! - Format and destination are fixed for the life of the process; a reload
//!   that changes them is logged and ignored
//! - `syslog` is accepted for compatibility and writes to stderr

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Layer, Registry};

use crate::config::{LogConfig, LogFormat, LogTarget};

type FilteredRegistry = Layered<reload::Layer<EnvFilter, Registry>, Registry>;

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log level {level}: {reason}")]
    InvalidLevel { level: String, reason: String },

    #[error("unable to install log subscriber: {0}")]
    Init(String),

    #[error("unable to reload log filter: {0}")]
    Reload(#[from] reload::Error),
}

/// Live handle on the installed subscriber.
pub struct Logging {
    handle: reload::Handle<EnvFilter, Registry>,
    current: LogConfig,
}

impl Logging {
    /// Apply a reloaded `log` section.
    pub fn apply(&mut self, config: &LogConfig) -> Result<(), LoggingError> {
        if config.format != self.current.format || config.to != self.current.to {
            tracing::warn!(
                format = ?config.format,
                to = ?config.to,
                "Log format and destination cannot change on reload, restart to apply"
            );
        }

        if env_filter().is_none() && config.level != self.current.level {
            self.handle.reload(level_filter(&config.level)?)?;
            tracing::info!(level = %config.level, "Log level changed");
        }

        self.current.level = config.level.clone();
        Ok(())
    }
}

impl std::fmt::Debug for Logging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logging").field("current", &self.current).finish()
    }
}

/// Install the global subscriber.
pub fn init_logging(config: &LogConfig) -> Result<Logging, LoggingError> {
    let filter = match env_filter() {
        Some(filter) => filter,
        None => level_filter(&config.level)?,
    };
    let (filter, handle) = reload::Layer::new(filter);

    let fmt_layer: Box<dyn Layer<FilteredRegistry> + Send + Sync> = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(make_writer(config.to))
            .boxed(),
        LogFormat::Text => fmt::layer().with_writer(make_writer(config.to)).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    if config.to == LogTarget::Syslog {
        tracing::warn!(
            address = config.syslog.as_deref().unwrap_or("local"),
            "Syslog output is not supported, logging to stderr"
        );
    }

    Ok(Logging {
        handle,
        current: config.clone(),
    })
}

fn env_filter() -> Option<EnvFilter> {
    std::env::var("RUST_LOG")
        .ok()
        .filter(|v| !v.is_empty())
        .and_then(|_| EnvFilter::try_from_default_env().ok())
}

fn level_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    let directive = match level.to_ascii_lowercase().as_str() {
        "panic" | "fatal" => "error".to_string(),
        "warning" => "warn".to_string(),
        other => other.to_string(),
    };
    EnvFilter::try_new(&directive).map_err(|e| LoggingError::InvalidLevel {
        level: level.to_string(),
        reason: e.to_string(),
    })
}

fn make_writer(target: LogTarget) -> BoxMakeWriter {
    match target {
        LogTarget::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogTarget::Discard => BoxMakeWriter::new(std::io::sink),
        LogTarget::Stderr | LogTarget::Syslog => BoxMakeWriter::new(std::io::stderr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_aliases() {
        assert!(level_filter("fatal").is_ok());
        assert!(level_filter("warning").is_ok());
        assert!(level_filter("debug").is_ok());
        assert!(matches!(
            level_filter("ttserver=loud"),
            Err(LoggingError::InvalidLevel { .. })
        ));
    }
}
