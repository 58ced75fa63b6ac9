use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn from_log(level: log::Level) -> Self {
        match level {
            log::Level::Trace => Self::Trace,
            log::Level::Debug => Self::Debug,
            log::Level::Info => Self::Info,
            log::Level::Warn => Self::Warn,
            log::Level::Error => Self::Error,
        }
    }

    fn to_filter(self) -> log::LevelFilter {
        match self {
            Self::Trace => log::LevelFilter::Trace,
            Self::Debug => log::LevelFilter::Debug,
            Self::Info => log::LevelFilter::Info,
            Self::Warn => log::LevelFilter::Warn,
            Self::Error => log::LevelFilter::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

pub trait LogSink: Send + Sync {
    fn log(&self, record: LogRecord);
}

pub type SharedLogSink = Arc<dyn LogSink>;

#[derive(Default)]
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn log(&self, _record: LogRecord) {}
}

/// Collects records in memory; used by tests to assert on pipeline output.
#[derive(Default)]
pub struct VecLogSink {
    records: Mutex<Vec<LogRecord>>,
}

impl VecLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn count_at(&self, level: LogLevel) -> usize {
        self.records()
            .iter()
            .filter(|record| record.level == level)
            .count()
    }
}

impl LogSink for VecLogSink {
    fn log(&self, record: LogRecord) {
        if let Ok(mut guard) = self.records.lock() {
            guard.push(record);
        }
    }
}

/// Prints records at or above `min_level`; warnings and errors go to stderr.
#[derive(Clone)]
pub struct StdoutLogSink {
    min_level: LogLevel,
}

impl StdoutLogSink {
    pub fn new() -> Self {
        Self::with_min_level(LogLevel::Info)
    }

    pub fn with_min_level(min_level: LogLevel) -> Self {
        Self { min_level }
    }
}

impl Default for StdoutLogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for StdoutLogSink {
    fn log(&self, record: LogRecord) {
        if record.level < self.min_level {
            return;
        }
        if record.level >= LogLevel::Warn {
            eprintln!("[{}] {}", record.level, record.message);
        } else {
            println!("[{}] {}", record.level, record.message);
        }
    }
}

/// Forwards records emitted through the `log` facade (the backend adapters
/// log their retries that way) into a [`LogSink`].
pub struct SinkLogger {
    sink: SharedLogSink,
    min_level: LogLevel,
}

impl SinkLogger {
    pub fn new(sink: SharedLogSink, min_level: LogLevel) -> Self {
        Self { sink, min_level }
    }

    /// Installs the logger process-wide. Fails if another logger is already
    /// registered.
    pub fn install(self) -> Result<(), log::SetLoggerError> {
        let filter = self.min_level.to_filter();
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(filter);
        Ok(())
    }
}

impl log::Log for SinkLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        LogLevel::from_log(metadata.level()) >= self.min_level
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.sink.log(LogRecord::new(
            LogLevel::from_log(record.level()),
            record.args().to_string(),
        ));
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    #[test]
    fn levels_are_ordered_by_severity() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn sink_logger_filters_below_threshold() {
        let sink = Arc::new(VecLogSink::new());
        let logger = SinkLogger::new(sink.clone(), LogLevel::Warn);

        logger.log(
            &log::Record::builder()
                .level(log::Level::Info)
                .args(format_args!("quiet"))
                .build(),
        );
        logger.log(
            &log::Record::builder()
                .level(log::Level::Warn)
                .args(format_args!("attempt 2/10 failed"))
                .build(),
        );

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, LogLevel::Warn);
        assert_eq!(records[0].message, "attempt 2/10 failed");
    }

    #[test]
    fn installed_logger_receives_facade_records() {
        let sink = Arc::new(VecLogSink::new());
        SinkLogger::new(sink.clone(), LogLevel::Info)
            .install()
            .expect("first logger in this test binary");

        log::debug!("filtered");
        log::warn!("[chapter_plot] attempt 1/3 failed");

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "[chapter_plot] attempt 1/3 failed");
    }
}
