//! Logging setup for host processes and workers.
//!
//! Host processes call [`init`] with a [`LogConfig`]. Workers started with log relaying
//! enabled call [`init_worker_relay`] instead, which writes one JSON record per event to
//! stderr; the parent reads that pipe with a [`LogRelay`] and re-emits every record through
//! its own subscriber, so filtering and formatting happen in one place.
//!
//! # Environment Variables
//!
//! - `MODELOPS_LOG` - Log filter (overrides RUST_LOG)
//! - `MODELOPS_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `MODELOPS_LOG_FORMAT` - Output format: pretty, compact, json
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use modelops::logging::{LogConfig, init};
//!
//! init(LogConfig::default().with_env_overrides());
//! ```

use std::io::{BufRead, BufReader, Read};
use std::str::FromStr;
use std::thread::{self, JoinHandle};

use serde_json::Value;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::Result;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format (default for development)
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Logging configuration.
///
/// Use the builder methods to customize, then pass to [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    /// Log format (default: Pretty)
    pub format: LogFormat,
    /// Log span timing on close (default: false)
    pub span_events: bool,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    /// Show target module in logs (default: true)
    pub show_target: bool,
    /// Show thread IDs (default: false)
    pub show_thread_ids: bool,
    /// Show line numbers (default: false)
    pub show_line_numbers: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            span_events: false,
            filter: None,
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

impl LogConfig {
    /// Create a new LogConfig with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the log format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable span timing events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Set a custom filter string.
    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Reads from:
    /// - `MODELOPS_LOG` or `RUST_LOG` for filter (only if filter not already set from CLI)
    /// - `MODELOPS_LOG_FORMAT` for format
    /// - `MODELOPS_LOG_LEVEL` for level (only if filter not already set)
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("MODELOPS_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level_str) = std::env::var("MODELOPS_LOG_LEVEL")
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("MODELOPS_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        self
    }

    /// Build the EnvFilter for this configuration.
    fn build_filter(&self) -> EnvFilter {
        if let Some(ref filter) = self.filter {
            EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                EnvFilter::new(format!("{}", self.level).to_lowercase())
            })
        } else {
            EnvFilter::new(format!("{}", self.level).to_lowercase())
        }
    }
}

/// Parse a log level string.
pub(crate) fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Initialize the global tracing subscriber.
///
/// This should be called once at program startup. Subsequent calls are silently ignored.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();

    let span_events = if config.span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let result = match config.format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_span_events(span_events)
                .with_target(config.show_target)
                .with_writer(std::io::stderr);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()
        }
        LogFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_span_events(span_events)
                .with_target(config.show_target)
                .with_thread_ids(config.show_thread_ids)
                .with_line_number(config.show_line_numbers)
                .with_writer(std::io::stderr);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()
        }
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .with_span_events(span_events)
                .with_target(config.show_target)
                .with_thread_ids(config.show_thread_ids)
                .with_line_number(config.show_line_numbers)
                .with_writer(std::io::stderr);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()
        }
    };

    // Silently ignore if already initialized (idempotent)
    let _ = result;
}

/// Initialize a worker's subscriber for relaying through the parent.
///
/// Everything down to TRACE is written; the parent's filter decides what is shown.
pub fn init_worker_relay() {
    let layer = fmt::layer()
        .json()
        .with_target(true)
        .with_current_span(false)
        .with_span_list(false)
        .with_ansi(false)
        .with_writer(std::io::stderr);

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("trace"))
        .with(layer)
        .try_init();
}

/// One worker log record, decoded from a relayed line.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RelayRecord {
    pub level: Level,
    pub origin: String,
    pub message: String,
    /// Remaining structured fields, rendered as JSON.
    pub fields: Option<String>,
}

impl RelayRecord {
    /// Decode a line written by [`init_worker_relay`].
    ///
    /// Lines that are not JSON event records (panic messages, stray prints) come back as INFO
    /// records carrying the raw text.
    pub(crate) fn parse(line: &str) -> Self {
        let raw = || Self {
            level: Level::INFO,
            origin: "stderr".to_string(),
            message: line.to_string(),
            fields: None,
        };

        let Ok(Value::Object(mut record)) = serde_json::from_str::<Value>(line) else {
            return raw();
        };
        let Some(level) = record
            .get("level")
            .and_then(Value::as_str)
            .and_then(parse_level)
        else {
            return raw();
        };

        let origin = record
            .get("target")
            .and_then(Value::as_str)
            .unwrap_or("worker")
            .to_string();

        let mut message = String::new();
        let mut fields = None;
        if let Some(Value::Object(mut map)) = record.remove("fields") {
            if let Some(Value::String(m)) = map.remove("message") {
                message = m;
            }
            if !map.is_empty() {
                fields = Some(Value::Object(map).to_string());
            }
        }

        Self {
            level,
            origin,
            message,
            fields,
        }
    }

    /// Emit this record through the local subscriber.
    fn emit(&self, worker: usize) {
        let fields = self.fields.as_deref().unwrap_or("");
        macro_rules! relay {
            ($level:expr) => {
                tracing::event!(
                    target: "modelops::worker",
                    $level,
                    worker,
                    origin = %self.origin,
                    fields,
                    "{}",
                    self.message
                )
            };
        }
        match self.level {
            Level::ERROR => relay!(Level::ERROR),
            Level::WARN => relay!(Level::WARN),
            Level::INFO => relay!(Level::INFO),
            Level::DEBUG => relay!(Level::DEBUG),
            _ => relay!(Level::TRACE),
        }
    }
}

/// Background thread forwarding a worker's stderr into this process's subscriber.
#[derive(Debug)]
pub struct LogRelay {
    worker: usize,
    handle: Option<JoinHandle<()>>,
}

impl LogRelay {
    /// Start relaying lines from `source` on behalf of `worker`.
    pub fn spawn<R: Read + Send + 'static>(worker: usize, source: R) -> Result<Self> {
        let handle = thread::Builder::new()
            .name(format!("modelops-log-{}", worker))
            .spawn(move || {
                let reader = BufReader::new(source);
                for line in reader.lines() {
                    let Ok(line) = line else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    RelayRecord::parse(&line).emit(worker);
                }
            })?;
        Ok(Self {
            worker,
            handle: Some(handle),
        })
    }

    /// Worker this relay belongs to.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Wait for the relay to drain. Returns once the worker's stderr is closed.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("invalid".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("error"), Some(Level::ERROR));
        assert_eq!(parse_level("warn"), Some(Level::WARN));
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("info"), Some(Level::INFO));
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level("trace"), Some(Level::TRACE));
        assert_eq!(parse_level("INFO"), Some(Level::INFO));
        assert_eq!(parse_level("invalid"), None);
    }

    #[test]
    fn test_log_config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.filter.is_none());
        assert!(!config.span_events);
        assert!(config.show_target);
    }

    #[test]
    fn test_log_config_builder() {
        let config = LogConfig::new()
            .with_level(Level::DEBUG)
            .with_format(LogFormat::Json)
            .with_span_events(true)
            .with_filter("modelops=trace".into());

        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.span_events);
        assert_eq!(config.filter.as_deref(), Some("modelops=trace"));
    }

    #[test]
    fn test_relay_record_from_json() {
        let line = r#"{"timestamp":"2024-01-01T00:00:00Z","level":"WARN","fields":{"message":"model is large","bytes":1024},"target":"modelops::sharing"}"#;
        let record = RelayRecord::parse(line);
        assert_eq!(record.level, Level::WARN);
        assert_eq!(record.origin, "modelops::sharing");
        assert_eq!(record.message, "model is large");
        assert_eq!(record.fields.as_deref(), Some(r#"{"bytes":1024}"#));
    }

    #[test]
    fn test_relay_record_without_extra_fields() {
        let line = r#"{"level":"DEBUG","fields":{"message":"ready"},"target":"modelops::worker"}"#;
        let record = RelayRecord::parse(line);
        assert_eq!(record.level, Level::DEBUG);
        assert!(record.fields.is_none());
    }

    #[test]
    fn test_relay_record_from_plain_text() {
        let record = RelayRecord::parse("thread 'main' panicked at src/demo.rs:10:5");
        assert_eq!(record.level, Level::INFO);
        assert_eq!(record.origin, "stderr");
        assert!(record.message.contains("panicked"));

        let record = RelayRecord::parse(r#"{"not":"a record"}"#);
        assert_eq!(record.level, Level::INFO);
        assert_eq!(record.message, r#"{"not":"a record"}"#);
    }

    #[test]
    fn test_log_relay_drains_source() {
        let source = std::io::Cursor::new(
            b"{\"level\":\"INFO\",\"fields\":{\"message\":\"hello\"},\"target\":\"t\"}\nplain\n\n"
                .to_vec(),
        );
        let relay = LogRelay::spawn(3, source).unwrap();
        assert_eq!(relay.worker(), 3);
        relay.join();
    }
}
