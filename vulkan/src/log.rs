//! Logger context carried by each device.
//!
//! The library never installs a global subscriber. A [`Logger`] wraps a
//! [`tracing::Dispatch`] built from a [`LogConfig`]; components emit their
//! `tracing` events inside [`Logger::scope`], so two devices in one process can
//! log at different levels to different sinks.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::Dispatch;
use tracing_subscriber::filter::LevelFilter;

use crate::error::{Result, VulkanError};

/// Filter threshold, lowest to highest severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    #[default]
    Warn,
    Error,
    Off,
}

impl LogLevel {
    fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off => LevelFilter::OFF,
        }
    }
}

impl FromStr for LogLevel {
    type Err = VulkanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "off" | "none" => Ok(LogLevel::Off),
            other => Err(VulkanError::config("log.level", format!("unknown level `{other}`"))),
        }
    }
}

/// In-memory sink; clones share one buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Number of lines emitted at `WARN`.
    pub fn warnings(&self) -> usize {
        self.contents().lines().filter(|l| l.contains("WARN")).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Output target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSink {
    Stdout,
    #[default]
    Stderr,
    /// Appends to the file, creating it if missing.
    File(PathBuf),
    #[serde(skip)]
    Buffer(SharedBuffer),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub sink: LogSink,
}

/// Explicit logging context. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Logger {
    dispatch: Dispatch,
}

impl Logger {
    pub fn new(config: &LogConfig) -> Result<Self> {
        let builder = tracing_subscriber::fmt()
            .with_max_level(config.level.filter())
            .with_target(true);
        let dispatch = match &config.sink {
            LogSink::Stdout => Dispatch::new(builder.with_writer(io::stdout).finish()),
            LogSink::Stderr => Dispatch::new(builder.with_writer(io::stderr).finish()),
            LogSink::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| VulkanError::ConfigRead { path: path.clone(), source })?;
                Dispatch::new(builder.with_ansi(false).with_writer(Mutex::new(file)).finish())
            }
            LogSink::Buffer(buffer) => {
                let buffer = buffer.clone();
                Dispatch::new(
                    builder
                        .with_ansi(false)
                        .without_time()
                        .with_writer(move || buffer.clone())
                        .finish(),
                )
            }
        };
        Ok(Logger { dispatch })
    }

    /// Logger that drops every event.
    pub fn disabled() -> Self {
        Logger { dispatch: Dispatch::none() }
    }

    /// Logger writing into a fresh [`SharedBuffer`], returned alongside it.
    pub fn capture(level: LogLevel) -> (Self, SharedBuffer) {
        let buffer = SharedBuffer::new();
        let config = LogConfig { level, sink: LogSink::Buffer(buffer.clone()) };
        let logger = Logger::new(&config).unwrap_or_else(|_| Logger::disabled());
        (logger, buffer)
    }

    /// Run `f` with this logger as the current `tracing` dispatcher.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> R {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger::new(&LogConfig::default()).unwrap_or_else(|_| Logger::disabled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_threshold() {
        let (logger, buffer) = Logger::capture(LogLevel::Warn);
        logger.scope(|| {
            tracing::info!("hidden");
            tracing::warn!("shown");
            tracing::error!("also shown");
        });
        let out = buffer.contents();
        assert!(!out.contains("hidden"));
        assert!(out.contains("shown"));
        assert_eq!(buffer.warnings(), 1);
    }

    #[test]
    fn test_loggers_are_independent() {
        let (quiet, quiet_buf) = Logger::capture(LogLevel::Off);
        let (loud, loud_buf) = Logger::capture(LogLevel::Trace);
        quiet.scope(|| tracing::warn!("nothing"));
        loud.scope(|| tracing::debug!("something"));
        assert!(quiet_buf.contents().is_empty());
        assert!(loud_buf.contents().contains("something"));
    }

    #[test]
    fn test_parse_level() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vuml.log");
        let config = LogConfig { level: LogLevel::Info, sink: LogSink::File(path.clone()) };
        let logger = Logger::new(&config).unwrap();
        logger.scope(|| tracing::info!("first"));
        logger.scope(|| tracing::info!("second"));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("first") && text.contains("second"));
    }

    #[test]
    fn test_sink_json() {
        let config: LogConfig =
            serde_json::from_str(r#"{"level":"debug","sink":{"file":"/tmp/x.log"}}"#).unwrap();
        assert_eq!(config.level, LogLevel::Debug);
        assert!(matches!(config.sink, LogSink::File(ref p) if p.ends_with("x.log")));
        let config: LogConfig = serde_json::from_str(r#"{"sink":"stdout"}"#).unwrap();
        assert!(matches!(config.sink, LogSink::Stdout));
        assert_eq!(config.level, LogLevel::Warn);
    }
}
