#![forbid(unsafe_code)]

//! The fan-out tracing layer behind the logging core.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::sync::Mutex;

use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use super::{
    category_for_target, LogCallback, LogCategory, LogLevel, LogSinks, TelemetryConfig,
};
use crate::clock::Clock;
use crate::error::{Error, Result};

/// Filters events by level threshold and category mask, then writes
/// `[<elapsed_ms>][<LVL>] <message>` lines to the enabled sinks.
///
/// Filtering happens before the event's fields are visited, so dropped
/// events never pay formatting cost.
pub struct FanoutLayer {
    threshold: LogLevel,
    categories: LogCategory,
    sinks: LogSinks,
    file: Option<Mutex<File>>,
    callback: Option<LogCallback>,
    clock: Clock,
}

impl FanoutLayer {
    pub fn from_config(config: &TelemetryConfig, callback: Option<LogCallback>) -> Result<Self> {
        let file = if config.sinks.contains(LogSinks::FILE) {
            let path = config
                .file_path
                .as_ref()
                .ok_or(Error::InvalidParam("file sink without file_path"))?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::Config(format!("Failed to open log file: {e}")))?;
            Some(Mutex::new(file))
        } else {
            None
        };
        Ok(Self {
            threshold: config.level,
            categories: config.categories,
            sinks: config.sinks,
            file,
            callback,
            clock: Clock::new(),
        })
    }
}

impl<S: tracing::Subscriber> Layer<S> for FanoutLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = LogLevel::from_tracing(metadata.level());
        if level > self.threshold || self.threshold == LogLevel::None {
            return;
        }
        let category = category_for_target(metadata.target());
        if !self.categories.intersects(category) {
            return;
        }

        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let line = format!("[{}][{}] {}", self.clock.now_ms(), level.tag(), visitor.line);

        if self.sinks.contains(LogSinks::CONSOLE) {
            eprintln!("{line}");
        }
        if self.sinks.contains(LogSinks::FILE) {
            if let Some(file) = &self.file {
                if let Ok(mut file) = file.lock() {
                    let _ = writeln!(file, "{line}");
                }
            }
        }
        if self.sinks.contains(LogSinks::CALLBACK) {
            if let Some(callback) = &self.callback {
                callback(level, category, &line);
            }
        }
    }
}

/// Renders the message field first, then any structured fields as `k=v`.
#[derive(Default)]
struct LineVisitor {
    line: String,
}

impl LineVisitor {
    fn prepend_message(&mut self, mut message: String) {
        if !self.line.is_empty() {
            message.push(' ');
        }
        self.line.insert_str(0, &message);
    }
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let mut rendered = String::new();
            let _ = write!(rendered, "{value:?}");
            self.prepend_message(rendered);
        } else {
            if !self.line.is_empty() {
                self.line.push(' ');
            }
            let _ = write!(self.line, "{}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.prepend_message(value.to_owned());
        } else {
            if !self.line.is_empty() {
                self.line.push(' ');
            }
            let _ = write!(self.line, "{}={}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::Arc;
    use tracing_subscriber::layer::SubscriberExt;

    fn config(sinks: LogSinks, level: LogLevel) -> TelemetryConfig {
        TelemetryConfig { level, categories: LogCategory::all(), sinks, file_path: None }
    }

    #[test]
    fn callback_sink_receives_filtered_lines() {
        let seen: Arc<Mutex<Vec<(LogLevel, String)>>> = Arc::default();
        let sink = seen.clone();
        let layer = FanoutLayer::from_config(
            &config(LogSinks::CALLBACK, LogLevel::Info),
            Some(Arc::new(move |level, _cat, line| {
                sink.lock().unwrap().push((level, line.to_owned()));
            })),
        )
        .unwrap();
        let subscriber = tracing_subscriber::Registry::default().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "peertalk::discovery", peers = 3usize, "announce sent");
            tracing::debug!(target: "peertalk::discovery", "filtered: below threshold");
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, LogLevel::Info);
        assert!(seen[0].1.contains("announce sent"), "line: {}", seen[0].1);
        assert!(seen[0].1.contains("peers=3"), "line: {}", seen[0].1);
        assert!(seen[0].1.contains("[INFO]"), "line: {}", seen[0].1);
    }

    #[test]
    fn category_mask_drops_unwanted_modules() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = seen.clone();
        let mut cfg = config(LogSinks::CALLBACK, LogLevel::Debug);
        cfg.categories = LogCategory::PROTOCOL;
        let layer = FanoutLayer::from_config(
            &cfg,
            Some(Arc::new(move |_l, _c, line| sink.lock().unwrap().push(line.to_owned()))),
        )
        .unwrap();
        let subscriber = tracing_subscriber::Registry::default().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "peertalk::recv", "kept");
            tracing::info!(target: "peertalk::discovery", "dropped: wrong category");
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("kept"));
    }

    #[test]
    fn file_sink_appends_formatted_lines() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let cfg = TelemetryConfig {
            level: LogLevel::Info,
            categories: LogCategory::all(),
            sinks: LogSinks::FILE,
            file_path: Some(tmp.path().to_path_buf()),
        };
        let layer = FanoutLayer::from_config(&cfg, None).unwrap();
        let subscriber = tracing_subscriber::Registry::default().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "peertalk::queue", "almost full");
        });

        let mut contents = String::new();
        File::open(tmp.path()).unwrap().read_to_string(&mut contents).unwrap();
        assert!(contents.contains("[WARN] almost full"), "file: {contents}");
        assert!(contents.starts_with('['), "file: {contents}");
    }

    #[test]
    fn file_sink_requires_path() {
        assert!(matches!(
            FanoutLayer::from_config(&config(LogSinks::FILE, LogLevel::Info), None),
            Err(Error::InvalidParam(_))
        ));
    }
}
