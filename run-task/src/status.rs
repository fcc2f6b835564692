//! Status lines emitted on stdout for every phase transition.
//!
//! Lines look like `[setup 2024-05-01T12:00:00.123Z] message` and are the
//! product log the CI system archives. Output from the task itself is relayed
//! through the same writer with the `task` phase, so every line in the task
//! log carries a prefix and a timestamp.

use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

/// Cloneable handle to the status stream.
///
/// Writes are serialized behind a mutex; call order is line order. Write
/// errors are swallowed: losing a status line must never abort a task.
#[derive(Clone)]
pub struct StatusLog {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl StatusLog {
    pub fn new<W: Write + Send + 'static>(sink: W) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Emit `message` under `phase`. Multi-line messages produce one prefixed
    /// line per input line.
    pub fn emit(&self, phase: &str, message: &str) {
        let now = Utc::now();
        let Ok(mut sink) = self.sink.lock() else {
            return;
        };
        for line in message.lines() {
            let _ = sink.write_all(format_line(phase, now, line).as_bytes());
        }
        if message.is_empty() {
            let _ = sink.write_all(format_line(phase, now, "").as_bytes());
        }
        let _ = sink.flush();
    }
}

impl std::fmt::Debug for StatusLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusLog").finish_non_exhaustive()
    }
}

/// Render one status line (with trailing newline).
pub fn format_line(phase: &str, at: DateTime<Utc>, message: &str) -> String {
    format!(
        "[{phase} {}] {message}\n",
        at.format("%Y-%m-%dT%H:%M:%S%.3fZ")
    )
}
