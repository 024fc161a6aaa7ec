//! Engine log - Leveled log lines mirrored to an optional UI callback

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use chrono::Local;
use tracing::{error, info, warn};

/// Receives every formatted log line, e.g. to append it to a terminal widget
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Log level of an engine line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// Logging interface handed to the supervisor and its background loop.
///
/// Every line goes to `tracing`. If a callback is registered it also receives
/// the line rendered as `[HH:MM:SS] [LEVEL] message`. Cloning shares the
/// callback slot.
#[derive(Clone, Default)]
pub struct EngineLog {
    callback: Arc<RwLock<Option<LogCallback>>>,
}

impl EngineLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the line callback, replacing any previous one. `None` clears it.
    pub fn set_callback(&self, cb: Option<LogCallback>) {
        match self.callback.write() {
            Ok(mut slot) => *slot = cb,
            Err(poisoned) => *poisoned.into_inner() = cb,
        }
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        self.write(Level::Info, msg.as_ref());
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        self.write(Level::Warn, msg.as_ref());
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        self.write(Level::Error, msg.as_ref());
    }

    fn write(&self, level: Level, msg: &str) {
        match level {
            Level::Info => info!(target: "umbra::engine", "{}", msg),
            Level::Warn => warn!(target: "umbra::engine", "{}", msg),
            Level::Error => error!(target: "umbra::engine", "{}", msg),
        }

        // Clone out so the callback never runs under the lock
        let cb = self
            .callback
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().map(Arc::clone));

        if let Some(cb) = cb {
            let line = format_line(level, msg);
            if catch_unwind(AssertUnwindSafe(|| cb(&line))).is_err() {
                warn!("Log callback panicked; line dropped");
            }
        }
    }
}

impl std::fmt::Debug for EngineLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered = self
            .callback
            .read()
            .map(|slot| slot.is_some())
            .unwrap_or(false);
        f.debug_struct("EngineLog")
            .field("callback", &registered)
            .finish()
    }
}

/// Render a line the way the terminal panel shows it
pub fn format_line(level: Level, msg: &str) -> String {
    format!("[{}] [{}] {}", Local::now().format("%H:%M:%S"), level.label(), msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn capture(log: &EngineLog) -> Arc<Mutex<Vec<String>>> {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        log.set_callback(Some(Arc::new(move |line: &str| {
            sink.lock().unwrap().push(line.to_string());
        })));
        lines
    }

    #[test]
    fn callback_receives_formatted_lines() {
        let log = EngineLog::new();
        let lines = capture(&log);

        log.info("Engine started.");
        log.error("boom");

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO] Engine started."));
        assert!(lines[1].ends_with("[ERROR] boom"));
        assert!(lines[0].starts_with('['));
    }

    #[test]
    fn registration_replaces_previous_callback() {
        let log = EngineLog::new();
        let first = capture(&log);
        let second = capture(&log);

        log.warn("hello");

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    fn explode(_: &str) {
        panic!("ui went away");
    }

    #[test]
    fn panicking_callback_is_contained() {
        let log = EngineLog::new();
        log.set_callback(Some(Arc::new(explode)));

        log.info("still fine");

        let lines = capture(&log);
        log.info("after");
        assert_eq!(lines.lock().unwrap().len(), 1);
    }

    #[test]
    fn clones_share_the_callback() {
        let log = EngineLog::new();
        let worker_log = log.clone();
        let lines = capture(&log);

        worker_log.error("core process exited unexpectedly");

        assert_eq!(lines.lock().unwrap().len(), 1);
    }
}
