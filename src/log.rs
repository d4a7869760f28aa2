//! Logging for migration execution.
//!
//! The engine takes an injected [MigrationLog]. During each version's
//! transaction the injected log is wrapped in a [CaptureLog] that both
//! forwards every line and buffers it; the flushed buffer becomes the
//! `log` column of that version's history row.

use std::sync::Arc;

use parking_lot::Mutex;

#[cfg(windows)]
pub(crate) const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
pub(crate) const LINE_ENDING: &str = "\n";

/// The logging surface the engine writes migration progress to.
pub trait MigrationLog: Send + Sync {
    fn trace(&self, message: &str);
    fn info(&self, message: &str);
    fn warn(&self, message: &str);

    /// Derive a log scoped to `name` (the engine derives one child per
    /// version it executes).
    fn child(&self, name: &str) -> Arc<dyn MigrationLog>;
}

/// Default [MigrationLog] forwarding to the `tracing` macros, carrying
/// the scope chain as a `version` field.
#[derive(Debug, Clone, Default)]
pub struct TracingLog {
    scope: Option<String>,
}

impl TracingLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MigrationLog for TracingLog {
    fn trace(&self, message: &str) {
        match &self.scope {
            Some(scope) => tracing::trace!(version = %scope, "{message}"),
            None => tracing::trace!("{message}"),
        }
    }

    fn info(&self, message: &str) {
        match &self.scope {
            Some(scope) => tracing::info!(version = %scope, "{message}"),
            None => tracing::info!("{message}"),
        }
    }

    fn warn(&self, message: &str) {
        match &self.scope {
            Some(scope) => tracing::warn!(version = %scope, "{message}"),
            None => tracing::warn!("{message}"),
        }
    }

    fn child(&self, name: &str) -> Arc<dyn MigrationLog> {
        let scope = match &self.scope {
            Some(scope) => format!("{scope}/{name}"),
            None => name.to_owned(),
        };
        Arc::new(Self { scope: Some(scope) })
    }
}

/// A log that forwards every line to its inner log and also appends it,
/// prefixed by `"[LEVEL] "`, to a shared line buffer. [CaptureLog::flush]
/// returns the buffered transcript joined by the platform EOL and resets
/// the buffer.
pub struct CaptureLog {
    inner: Arc<dyn MigrationLog>,
    lines: Arc<Mutex<Vec<String>>>,
}

impl CaptureLog {
    pub fn new(inner: Arc<dyn MigrationLog>) -> Self {
        Self {
            inner,
            lines: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn append(&self, level: &str, message: &str) {
        self.lines.lock().push(format!("[{level}] {message}"));
    }

    /// Return the captured transcript and reset the buffer.
    pub fn flush(&self) -> String {
        let mut lines = self.lines.lock();
        let text = lines.join(LINE_ENDING);
        lines.clear();
        text
    }
}

impl MigrationLog for CaptureLog {
    fn trace(&self, message: &str) {
        self.inner.trace(message);
        self.append("TRACE", message);
    }

    fn info(&self, message: &str) {
        self.inner.info(message);
        self.append("INFO", message);
    }

    fn warn(&self, message: &str) {
        self.inner.warn(message);
        self.append("WARN", message);
    }

    fn child(&self, name: &str) -> Arc<dyn MigrationLog> {
        // children keep feeding the same capture buffer
        Arc::new(Self {
            inner: self.inner.child(name),
            lines: Arc::clone(&self.lines),
        })
    }
}
