//! Structured logging for the Whirlpool client core
//!
//! Thin layer over the `log` facade with an `env_logger` backend:
//! - Never logs private keys or fee-proof plaintext
//! - Truncates addresses, txids and payment codes passed as parameters
//! - Tags every event with the subsystem that emitted it
//! - Human-readable or JSON line output
//!
//! # Usage
//!
//! ```
//! use whirlpool_client::logging::{self, LogConfig, LogLevel};
//! use serde_json::json;
//!
//! logging::init(&LogConfig::default()).expect("Failed to initialize logging");
//!
//! logging::log_mix(
//!     LogLevel::Info,
//!     "mix started",
//!     Some(json!({ "utxo": "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b:0" })),
//! );
//! ```

use std::fs::OpenOptions;
use std::sync::Once;

use chrono::Local;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Subsystem that emitted a log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogContext {
    /// Tx0 sizing, assembly and signing
    Tx0,
    /// Mix scheduler and mix session callbacks
    Mix,
    /// Utxo config file
    Persistence,
    /// Backend calls: utxos, fee rate, Tx0 data, broadcast
    Backend,
}

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Path to log file (None for console-only)
    pub log_file: Option<String>,
    pub include_timestamps: bool,
    pub include_source_location: bool,
    /// Whether to use JSON format for logs (machine-readable)
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            log_file: None,
            include_timestamps: true,
            include_source_location: false,
            json_format: false,
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

static LOGGING_INIT: Once = Once::new();

/// Initialize the logging system with the given configuration
///
/// Safe to call more than once: only the first call installs the logger,
/// later calls return Ok without touching it.
pub fn init(config: &LogConfig) -> Result<(), String> {
    let mut result = Ok(());

    let include_timestamps = config.include_timestamps;
    let include_source_location = config.include_source_location;
    let json_format = config.json_format;
    let log_file = config.log_file.clone();
    let level = config.level;

    LOGGING_INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(level.into());

        builder.format(move |buf, record| {
            use std::io::Write;

            let timestamp = if include_timestamps {
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
            } else {
                String::new()
            };

            let source_location = if include_source_location {
                format!(
                    " [{}:{}]",
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0)
                )
            } else {
                String::new()
            };

            if json_format {
                let line = json!({
                    "timestamp": timestamp,
                    "level": record.level().to_string(),
                    "target": record.target(),
                    "location": source_location,
                    "message": record.args().to_string(),
                });
                writeln!(buf, "{}", line)
            } else {
                if include_timestamps {
                    write!(buf, "{} ", timestamp)?;
                }
                writeln!(buf, "[{}{}] {}", record.level(), source_location, record.args())
            }
        });

        if let Some(file_path) = &log_file {
            match OpenOptions::new().create(true).append(true).open(file_path) {
                Ok(file) => {
                    builder.target(env_logger::Target::Pipe(Box::new(file)));
                }
                Err(e) => {
                    result = Err(format!("Failed to open log file {}: {}", file_path, e));
                    return;
                }
            }
        }

        // Another logger may already be installed (tests, embedding app)
        if let Err(e) = builder.try_init() {
            if !e.to_string().contains("already") {
                result = Err(e.to_string());
            }
        }
    });

    result
}

/// Truncate a potentially identifying string for logging
///
/// Keeps the first and last 4 characters of anything longer than 8.
pub fn sanitize_for_logging(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = input.chars().collect();
    if chars.len() <= 8 {
        return "*****".to_string();
    }
    let first: String = chars[..4].iter().collect();
    let last: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", first, last)
}

// Strings above this length are assumed to be addresses, txids or keys.
const MAX_PLAIN_PARAM_LEN: usize = 16;

fn sanitize_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) if s.chars().count() > MAX_PLAIN_PARAM_LEN => {
            json!(sanitize_for_logging(s))
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_value(v)))
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sanitize_value).collect())
        }
        other => other.clone(),
    }
}

fn sanitize_and_log(
    level: LogLevel,
    context: LogContext,
    message: &str,
    params: Option<serde_json::Value>,
) {
    match params.as_ref().map(sanitize_value) {
        Some(params) => log::log!(level.into(), "[{:?}] {} {}", context, message, params),
        None => log::log!(level.into(), "[{:?}] {}", context, message),
    }
}

/// Log a Tx0 event
pub fn log_tx0(level: LogLevel, message: &str, params: Option<serde_json::Value>) {
    sanitize_and_log(level, LogContext::Tx0, message, params);
}

/// Log a mix scheduler event
pub fn log_mix(level: LogLevel, message: &str, params: Option<serde_json::Value>) {
    sanitize_and_log(level, LogContext::Mix, message, params);
}

/// Log a persistence event
pub fn log_persistence(level: LogLevel, message: &str, params: Option<serde_json::Value>) {
    sanitize_and_log(level, LogContext::Persistence, message, params);
}

/// Log a backend event
pub fn log_backend(level: LogLevel, message: &str, params: Option<serde_json::Value>) {
    sanitize_and_log(level, LogContext::Backend, message, params);
}
