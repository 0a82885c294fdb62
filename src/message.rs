//! Typed messages emitted by the engine: log records, upload progress and
//! task status transitions, fanned out to a process-wide sink plus the
//! running task's own callback.

use std::env;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::error::ErrorKind;
use crate::task::TaskStatus;

/// Severity of a log message, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

/// One message on the pipeline.
#[derive(Debug, Clone)]
pub enum Message {
    Log {
        level: LogLevel,
        err: Option<ErrorKind>,
        text: String,
    },
    /// Progress of a long operation, e.g. `{action: "Uploading", value, max}`.
    Progress {
        action: String,
        value: u64,
        max: u64,
    },
    Status(TaskStatus),
}

type Handler = std::sync::Arc<dyn Fn(&Message) + Send + Sync>;

static HANDLER: Mutex<Option<Handler>> = Mutex::new(None);
static VERBOSITY: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Replaces the process-wide message sink. Passing the closure of your choice
/// here is how a GUI or CLI takes ownership of the engine's output.
pub fn redirect(f: impl Fn(&Message) + Send + Sync + 'static) {
    *HANDLER.lock().unwrap() = Some(std::sync::Arc::new(f));
}

/// Restores the default sink (the `log` facade).
pub fn redirect_default() {
    *HANDLER.lock().unwrap() = None;
}

/// Sets the level below which the default sink drops log messages.
pub fn set_verbosity(level: LogLevel) {
    VERBOSITY.store(level as u8, Ordering::Relaxed);
}

/// True when `level` passes the configured verbosity, or when the
/// `TYRS_DEBUG` environment variable forces everything through.
pub fn log_level_is_enabled(level: LogLevel) -> bool {
    static DEBUG_ENV: OnceLock<bool> = OnceLock::new();

    let debug = *DEBUG_ENV.get_or_init(|| env::var_os("TYRS_DEBUG").is_some());
    VERBOSITY.load(Ordering::Relaxed) >= level as u8 || debug
}

/// Default sink: forward log records to the `log` facade, progress as debug.
pub fn default_handler(msg: &Message) {
    match msg {
        Message::Log { level, text, .. } => {
            if !log_level_is_enabled(*level) {
                return;
            }
            match level {
                LogLevel::Error => log::error!("{}", text),
                LogLevel::Warning => log::warn!("{}", text),
                LogLevel::Info => log::info!("{}", text),
                LogLevel::Debug => log::debug!("{}", text),
            }
        }
        Message::Progress { action, value, max } => {
            if log_level_is_enabled(LogLevel::Info) && *max > 0 {
                log::debug!("{}... {}%", action, 100 * value / max);
            }
        }
        Message::Status(_) => {}
    }
}

pub(crate) fn emit(msg: &Message) {
    crate::task::with_current(|task| emit_for(task, msg));
}

/// Delivers `msg` to the process-wide sink, then copies it to `task`'s own
/// callback when one is attached.
pub(crate) fn emit_for(task: Option<&crate::task::Task>, msg: &Message) {
    // Clone out of the lock: a sink may raise errors of its own.
    let handler = HANDLER.lock().unwrap().clone();
    match handler {
        Some(f) => f(msg),
        None => default_handler(msg),
    }

    if let Some(task) = task {
        task.deliver(msg);
    }
}

pub(crate) fn log(level: LogLevel, text: impl Into<String>) {
    emit(&Message::Log {
        level,
        err: None,
        text: text.into(),
    });
}

pub(crate) fn error(kind: ErrorKind, text: &str) {
    emit(&Message::Log {
        level: LogLevel::Error,
        err: Some(kind),
        text: text.to_string(),
    });
}

pub(crate) fn progress(action: &str, value: u64, max: u64) {
    emit(&Message::Progress {
        action: action.to_string(),
        value,
        max,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn log_levels_order_most_severe_first() {
        assert!(LogLevel::Error < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
    }

    #[test]
    fn redirected_sink_receives_progress() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        // Other tests emit progress too; match only this test's action so
        // parallel runs stay quiet.
        redirect(move |msg| {
            if let Message::Progress { action, value, max } = msg {
                if action == "sink-test" {
                    let _ = tx.lock().unwrap().send((*value, *max));
                }
            }
        });

        progress("sink-test", 7, 9);
        assert_eq!(
            rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap(),
            (7, 9)
        );

        redirect_default();
    }
}
