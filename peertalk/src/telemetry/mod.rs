#![forbid(unsafe_code)]

//! Level- and category-filtered logging with console/file/callback fan-out,
//! plus the perf-event side channel.
//!
//! The crate logs through `tracing` macros; [`FanoutLayer`] filters by level
//! threshold and category mask before any formatting cost is paid, then fans
//! the rendered line out to whichever sinks are enabled. Categories are
//! derived from the event target's module path, so embedders can also slot
//! the layer into their own subscriber stack.

mod layer;

pub use layer::FanoutLayer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

use crate::clock::Clock;
use crate::error::{Error, Result};

/// Log severity; `None` as a threshold silences everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    None,
    Err,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub(crate) fn from_tracing(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => Self::Err,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::INFO => Self::Info,
            _ => Self::Debug,
        }
    }

    pub(crate) fn tag(self) -> &'static str {
        match self {
            Self::None => "-",
            Self::Err => "ERR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
        }
    }
}

bitflags! {
    /// Log category mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LogCategory: u8 {
        const GENERAL = 0b0000_0001;
        const NETWORK = 0b0000_0010;
        const MEMORY = 0b0000_0100;
        const PROTOCOL = 0b0000_1000;
        const PERF = 0b0001_0000;
        /// Free slots for the embedding application.
        const APP1 = 0b0010_0000;
        const APP2 = 0b0100_0000;
    }

    /// Output sink mask; any subset may be enabled at once.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LogSinks: u8 {
        const CONSOLE = 0b0000_0001;
        const FILE = 0b0000_0010;
        const CALLBACK = 0b0000_0100;
    }
}

/// Category of an event, by the module that emitted it.
pub(crate) fn category_for_target(target: &str) -> LogCategory {
    let module = target.rsplit("::").next().unwrap_or(target);
    match module {
        "discovery" | "tcp" | "udp" | "transport" | "context" | "handle" => LogCategory::NETWORK,
        "wire" | "stream" | "datagram" | "recv" => LogCategory::PROTOCOL,
        "queue" | "batch" => LogCategory::MEMORY,
        "telemetry" | "layer" => LogCategory::PERF,
        _ => LogCategory::GENERAL,
    }
}

/// Receives every rendered log line when the CALLBACK sink is enabled.
pub type LogCallback = Arc<dyn Fn(LogLevel, LogCategory, &str) + Send + Sync>;

/// Receives perf entries; independent of the log sinks.
pub type PerfCallback = Arc<dyn Fn(&PerfEvent) + Send + Sync>;

/// What a perf entry measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PerfEventKind {
    /// value1 = batch bytes, value2 = entry count.
    BatchFlush = 1,
    /// value1 = queue pending, value2 = capacity.
    QueuePressure = 2,
}

/// A pre-filled performance entry.
#[derive(Debug, Clone, Copy)]
pub struct PerfEvent {
    pub seq: u32,
    pub timestamp_ms: u64,
    pub kind: PerfEventKind,
    pub value1: u32,
    pub value2: u32,
    pub flags: u8,
    pub category: LogCategory,
}

/// Hands perf entries to a dedicated callback; inert until one is set.
pub(crate) struct PerfRecorder {
    seq: AtomicU32,
    callback: Option<PerfCallback>,
    clock: Clock,
}

impl PerfRecorder {
    pub(crate) fn new(clock: Clock) -> Self {
        Self { seq: AtomicU32::new(0), callback: None, clock }
    }

    pub(crate) fn set_callback(&mut self, callback: PerfCallback) {
        self.callback = Some(callback);
    }

    pub(crate) fn record(&self, kind: PerfEventKind, value1: u32, value2: u32) {
        let Some(callback) = &self.callback else { return };
        let event = PerfEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp_ms: self.clock.now_ms(),
            kind,
            value1,
            value2,
            flags: 0,
            category: LogCategory::PERF,
        };
        callback(&event);
    }
}

impl std::fmt::Debug for PerfRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerfRecorder")
            .field("seq", &self.seq.load(Ordering::Relaxed))
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Telemetry settings; part of [`Config`](crate::config::Config).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub level: LogLevel,
    #[serde(deserialize_with = "de_categories")]
    pub categories: LogCategory,
    #[serde(deserialize_with = "de_sinks")]
    pub sinks: LogSinks,
    /// Required when the FILE sink is enabled.
    pub file_path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            categories: LogCategory::all(),
            sinks: LogSinks::CONSOLE,
            file_path: None,
        }
    }
}

fn de_categories<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<LogCategory, D::Error> {
    let names = Vec::<String>::deserialize(de)?;
    let mut mask = LogCategory::empty();
    for name in &names {
        mask |= match name.to_ascii_lowercase().as_str() {
            "general" => LogCategory::GENERAL,
            "network" => LogCategory::NETWORK,
            "memory" => LogCategory::MEMORY,
            "protocol" => LogCategory::PROTOCOL,
            "perf" => LogCategory::PERF,
            "app1" => LogCategory::APP1,
            "app2" => LogCategory::APP2,
            other => {
                return Err(serde::de::Error::custom(format!("unknown log category: {other}")))
            }
        };
    }
    Ok(mask)
}

fn de_sinks<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<LogSinks, D::Error> {
    let names = Vec::<String>::deserialize(de)?;
    let mut mask = LogSinks::empty();
    for name in &names {
        mask |= match name.to_ascii_lowercase().as_str() {
            "console" => LogSinks::CONSOLE,
            "file" => LogSinks::FILE,
            "callback" => LogSinks::CALLBACK,
            other => return Err(serde::de::Error::custom(format!("unknown log sink: {other}"))),
        };
    }
    Ok(mask)
}

/// Install a global subscriber built from `config`. Fails if a global
/// subscriber is already set, or the FILE sink is enabled without a path.
pub fn init(config: &TelemetryConfig) -> Result<()> {
    init_inner(config, None)
}

/// Like [`init`], with the CALLBACK sink wired to `callback`.
pub fn init_with_callback(config: &TelemetryConfig, callback: LogCallback) -> Result<()> {
    init_inner(config, Some(callback))
}

fn init_inner(config: &TelemetryConfig, callback: Option<LogCallback>) -> Result<()> {
    let layer = FanoutLayer::from_config(config, callback)?;
    let subscriber = Registry::default().with(layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|_| Error::InvalidState("global logger already set"))
}

/// Hot-path trace macro. Under the `interrupt-context` feature it compiles
/// to a dead branch: arguments are still type-checked, no call is emitted.
#[cfg(not(feature = "interrupt-context"))]
macro_rules! hot_trace {
    ($($arg:tt)*) => { tracing::trace!($($arg)*) };
}
#[cfg(feature = "interrupt-context")]
macro_rules! hot_trace {
    ($($arg:tt)*) => {
        if false {
            tracing::trace!($($arg)*);
        }
    };
}
pub(crate) use hot_trace;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_mapping() {
        assert_eq!(category_for_target("peertalk::discovery"), LogCategory::NETWORK);
        assert_eq!(category_for_target("peertalk::recv"), LogCategory::PROTOCOL);
        assert_eq!(category_for_target("peertalk::queue"), LogCategory::MEMORY);
        assert_eq!(category_for_target("some_app::main"), LogCategory::GENERAL);
    }

    #[test]
    fn level_ordering_matches_thresholds() {
        assert!(LogLevel::Err <= LogLevel::Warn);
        assert!(LogLevel::Debug > LogLevel::Info);
        assert!(LogLevel::None < LogLevel::Err);
    }

    #[test]
    fn perf_recorder_is_inert_without_callback() {
        let recorder = PerfRecorder::new(Clock::new());
        recorder.record(PerfEventKind::BatchFlush, 1, 2);
    }

    #[test]
    fn perf_recorder_sequences_events() {
        use std::sync::Mutex;
        let seen: Arc<Mutex<Vec<u32>>> = Arc::default();
        let sink = seen.clone();
        let mut recorder = PerfRecorder::new(Clock::new());
        recorder.set_callback(Arc::new(move |event| sink.lock().unwrap().push(event.seq)));
        recorder.record(PerfEventKind::BatchFlush, 100, 3);
        recorder.record(PerfEventKind::QueuePressure, 12, 32);
        assert_eq!(*seen.lock().unwrap(), [0, 1]);
    }
}
