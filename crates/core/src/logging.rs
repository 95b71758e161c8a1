use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
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

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace => LogLevel::Trace,
            log::Level::Debug => LogLevel::Debug,
            log::Level::Info => LogLevel::Info,
            log::Level::Warn => LogLevel::Warn,
            log::Level::Error => LogLevel::Error,
        }
    }
}

/// Where in the pipeline a record was produced.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scope {
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<usize>,
}

impl Scope {
    pub fn stage(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            chapter: None,
            section: None,
        }
    }

    pub fn chapter(mut self, number: u32) -> Self {
        self.chapter = Some(number);
        self
    }

    pub fn section(mut self, index: usize) -> Self {
        self.section = Some(index);
        self
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stage)?;
        if let Some(chapter) = self.chapter {
            write!(f, " | chapter {chapter}")?;
        }
        if let Some(section) = self.section {
            write!(f, " | section {}", section + 1)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            scope: None,
        }
    }

    pub fn scoped(level: LogLevel, scope: Scope, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            scope: Some(scope),
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "[{}] ({}) {}", self.level, scope, self.message),
            None => write!(f, "[{}] {}", self.level, self.message),
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

    pub fn messages_at(&self, level: LogLevel) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|record| record.level == level)
            .map(|record| record.message)
            .collect()
    }
}

impl LogSink for VecLogSink {
    fn log(&self, record: LogRecord) {
        if let Ok(mut guard) = self.records.lock() {
            guard.push(record);
        }
    }
}

#[derive(Clone, Copy)]
pub struct StdoutLogSink {
    min_level: LogLevel,
}

impl Default for StdoutLogSink {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
        }
    }
}

impl StdoutLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_level(min_level: LogLevel) -> Self {
        Self { min_level }
    }
}

impl LogSink for StdoutLogSink {
    fn log(&self, record: LogRecord) {
        if severity(record.level) >= severity(self.min_level) {
            println!("{record}");
        }
    }
}

fn severity(level: LogLevel) -> u8 {
    match level {
        LogLevel::Trace => 0,
        LogLevel::Debug => 1,
        LogLevel::Info => 2,
        LogLevel::Warn => 3,
        LogLevel::Error => 4,
    }
}

/// Forwards records emitted through the `log` facade into a [`LogSink`].
pub struct SinkLogger {
    sink: SharedLogSink,
}

impl SinkLogger {
    pub fn new(sink: SharedLogSink) -> Self {
        Self { sink }
    }
}

impl log::Log for SinkLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        self.sink.log(LogRecord::scoped(
            record.level().into(),
            Scope::stage(record.target()),
            record.args().to_string(),
        ));
    }

    fn flush(&self) {}
}

/// Installs a process-wide bridge from the `log` facade into `sink`.
///
/// Only the first call takes effect; later calls return `false`.
pub fn install_log_bridge(sink: SharedLogSink, max_level: log::LevelFilter) -> bool {
    static LOGGER: OnceLock<SinkLogger> = OnceLock::new();
    if LOGGER.get().is_some() {
        return false;
    }
    let logger = LOGGER.get_or_init(|| SinkLogger::new(sink));
    if log::set_logger(logger).is_err() {
        return false;
    }
    log::set_max_level(max_level);
    true
}
