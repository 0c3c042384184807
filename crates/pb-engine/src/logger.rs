//! Per-attempt logger — captures leveled messages into the attempt's
//! `JobResult` log, forwards them to `tracing`, and streams them to live
//! observers as `step.log.appended` events.

use crate::bus::EventBus;
use pb_core::event::{RunEvent, RunEventKind};
use pb_core::job::{LogEntry, LogLevel};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Scoped logger handed to a handler for one execution attempt.
///
/// Cloning is cheap; clones share the same entry buffer.
#[derive(Clone)]
pub struct AttemptLogger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    run_id: Uuid,
    step_key: String,
    entries: Mutex<Vec<LogEntry>>,
    bus: Option<Arc<EventBus>>,
}

impl AttemptLogger {
    pub fn new(run_id: Uuid, step_key: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                run_id,
                step_key: step_key.into(),
                entries: Mutex::new(Vec::new()),
                bus: None,
            }),
        }
    }

    pub fn with_bus(run_id: Uuid, step_key: impl Into<String>, bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                run_id,
                step_key: step_key.into(),
                entries: Mutex::new(Vec::new()),
                bus: Some(bus),
            }),
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(LogLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(LogLevel::Error, message.into());
    }

    /// Drain the captured entries, in order.
    pub fn take_entries(&self) -> Vec<LogEntry> {
        std::mem::take(
            &mut *self
                .inner
                .entries
                .lock()
                .expect("log entry mutex poisoned"),
        )
    }

    fn push(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Info => {
                tracing::info!(run_id = %self.inner.run_id, step = %self.inner.step_key, "{message}")
            }
            LogLevel::Warn => {
                tracing::warn!(run_id = %self.inner.run_id, step = %self.inner.step_key, "{message}")
            }
            LogLevel::Error => {
                tracing::error!(run_id = %self.inner.run_id, step = %self.inner.step_key, "{message}")
            }
        }

        let entry = LogEntry::new(level, message);
        if let Some(bus) = &self.inner.bus {
            bus.publish(&RunEvent::step(
                RunEventKind::StepLogAppended,
                self.inner.run_id,
                self.inner.step_key.clone(),
                serde_json::json!({
                    "level": entry.level,
                    "message": entry.message,
                }),
            ));
        }
        self.inner
            .entries
            .lock()
            .expect("log entry mutex poisoned")
            .push(entry);
    }
}

impl std::fmt::Debug for AttemptLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptLogger")
            .field("run_id", &self.inner.run_id)
            .field("step_key", &self.inner.step_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_captured_in_order() {
        let logger = AttemptLogger::new(Uuid::new_v4(), "draft");
        logger.info("starting");
        logger.warn("slow upstream");
        logger.error("gave up");

        let entries = logger.take_entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].level, LogLevel::Info);
        assert_eq!(entries[1].level, LogLevel::Warn);
        assert_eq!(entries[2].message, "gave up");

        // Drained.
        assert!(logger.take_entries().is_empty());
    }

    #[test]
    fn log_lines_stream_to_the_bus() {
        let bus = Arc::new(EventBus::new());
        let run_id = Uuid::new_v4();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = bus.subscribe(run_id, move |e| {
            s.lock().unwrap().push((e.kind, e.payload.clone()));
        });

        let logger = AttemptLogger::with_bus(run_id, "draft", bus);
        logger.info("hello");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, RunEventKind::StepLogAppended);
        assert_eq!(seen[0].1["message"], "hello");
    }
}
