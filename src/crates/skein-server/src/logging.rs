//! Structured logging with an in-process record buffer.
//!
//! Log output goes through `tracing`; the [`LogBuffer`] layer retains the
//! most recent records so the UI can page through them via the
//! LOG_REQ/LOG_RESP packets without touching files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::Level;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use skein_core::config::LoggingSettings;

const DEFAULT_CAPACITY: usize = 4096;

/// Severity mirrored into packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl From<&Level> for LogLevel {
    fn from(level: &Level) -> Self {
        match *level {
            Level::TRACE | Level::DEBUG => LogLevel::Debug,
            Level::INFO => LogLevel::Info,
            Level::WARN => LogLevel::Warning,
            Level::ERROR => LogLevel::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub logger_name: String,
    pub level: LogLevel,
    pub level_name: String,
    pub message: String,
    pub created: DateTime<Utc>,
}

/// Bounded in-memory buffer of recent log records.
#[derive(Default)]
pub struct LogBuffer {
    records: parking_lot::Mutex<Vec<LogRecord>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            records: parking_lot::Mutex::new(Vec::new()),
            capacity,
        })
    }

    pub fn push(&self, record: LogRecord) {
        let mut records = self.records.lock();
        records.push(record);
        let overflow = records.len().saturating_sub(self.capacity.max(1));
        if overflow > 0 {
            records.drain(..overflow);
        }
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

/// Tracing layer feeding the buffer.
pub struct LogBufferLayer {
    buffer: Arc<LogBuffer>,
}

impl LogBufferLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            let _ = write!(self.message, "{}={value:?}", field.name());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            let _ = write!(self.message, "{}={value}", field.name());
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for LogBufferLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);
        let metadata = event.metadata();
        self.buffer.push(LogRecord {
            logger_name: metadata.target().to_string(),
            level: metadata.level().into(),
            level_name: metadata.level().to_string(),
            message: visitor.message,
            created: Utc::now(),
        });
    }
}

fn build_filter(settings: Option<&LoggingSettings>) -> EnvFilter {
    let mut directives = String::new();
    match settings {
        Some(settings) => {
            directives.push_str(settings.default_level.as_filter());
            for (target, level) in &settings.enabled_loggers {
                let _ = write!(directives, ",{target}={}", level.as_filter());
            }
        }
        None => directives.push_str("info"),
    }
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber with the buffer layer. Safe to call more
/// than once; later calls keep the existing subscriber and only return a
/// fresh buffer when installation succeeded.
pub fn init_logging(settings: Option<&LoggingSettings>) -> Arc<LogBuffer> {
    let buffer = LogBuffer::new(DEFAULT_CAPACITY);
    let filter = build_filter(settings);
    let result = tracing_subscriber::registry()
        .with(filter)
        .with(LogBufferLayer::new(buffer.clone()))
        .try_init();
    if let Err(error) = result {
        tracing::debug!(%error, "logging already initialized");
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_caps_its_size() {
        let buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push(LogRecord {
                logger_name: "test".into(),
                level: LogLevel::Info,
                level_name: "INFO".into(),
                message: format!("m{i}"),
                created: Utc::now(),
            });
        }
        let records = buffer.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].message, "m2");
        assert_eq!(records[2].message, "m4");
    }

    #[test]
    fn filter_includes_per_target_overrides() {
        let mut settings = LoggingSettings::default();
        settings.default_level = skein_core::config::LogLevel::Error;
        settings
            .enabled_loggers
            .insert("noisy".into(), skein_core::config::LogLevel::Debug);
        let filter = build_filter(Some(&settings));
        let rendered = filter.to_string();
        assert!(rendered.contains("error"));
        assert!(rendered.contains("noisy=debug"));
    }
}
