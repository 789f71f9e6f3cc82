//! Line logger shared by every component.
//!
//! A line reads `<rfc3339 millis> [LEVEL] (thread) [context] message payload=<json>`.
//! The thread segment only appears for named threads, which covers the
//! reactor I/O threads and the report workers.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
}

impl LogLevel {
    pub fn from_config_value(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "verbose" | "trace" => Some(Self::Verbose),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Verbose => "VERBOSE",
        }
    }

    fn ansi_code(self) -> u8 {
        match self {
            Self::Error => 31,
            Self::Warn => 33,
            Self::Info => 32,
            Self::Debug => 36,
            Self::Verbose => 35,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    /// Colours the level tag with ANSI escapes.
    pub human_friendly: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            human_friendly: false,
        }
    }
}

pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) {
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{line}");
    }
}

struct LogRecord<'a> {
    timestamp: DateTime<Utc>,
    level: LogLevel,
    coloured: bool,
    thread: Option<&'a str>,
    context: Option<&'a str>,
    message: &'a str,
    payload: Option<&'a Value>,
}

impl fmt::Display for LogRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
        )?;
        if self.coloured {
            write!(
                f,
                "[\x1b[{}m{}\x1b[0m]",
                self.level.ansi_code(),
                self.level.as_str()
            )?;
        } else {
            write!(f, "[{}]", self.level.as_str())?;
        }
        if let Some(thread) = self.thread.filter(|name| *name != "main") {
            write!(f, " ({thread})")?;
        }
        if let Some(context) = self.context.filter(|ctx| !ctx.is_empty()) {
            write!(f, " [{context}]")?;
        }
        write!(f, " {}", self.message)?;
        if let Some(payload) = self.payload {
            write!(f, " payload={payload}")?;
        }
        Ok(())
    }
}

/// Cheap to clone; clones write to the same sink.
#[derive(Clone)]
pub struct Logger {
    config: LoggerConfig,
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub fn new(config: LoggerConfig) -> Self {
        Self::with_sink(config, Arc::new(StdoutSink))
    }

    pub fn with_sink(config: LoggerConfig, sink: Arc<dyn LogSink>) -> Self {
        Self { config, sink }
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.config.min_level
    }

    pub fn info(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Info, context, message, None);
    }

    pub fn log(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<Value>,
    ) {
        if !self.enabled(level) {
            return;
        }

        let current = thread::current();
        let record = LogRecord {
            timestamp: Utc::now(),
            level,
            coloured: self.config.human_friendly,
            thread: current.name(),
            context,
            message,
            payload: payload.as_ref(),
        };
        self.sink.write_line(&record.to_string());
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
