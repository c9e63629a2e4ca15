//! Fan-out registry for diagnostic records.
//!
//! Records are routed to every registered sink. Nothing is buffered: with no
//! sink registered, records are dropped and a single warning goes to stderr.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde::{Deserialize, Serialize};

/// Section used for everything the call-in bridge records.
pub const RULES_SECTION: &str = "rules";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Notice => "notice",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Fatal => "fatal",
        };
        f.write_str(label)
    }
}

pub type Sink = Arc<dyn Fn(&str, Level, &str) + Send + Sync>;
pub type Cleanup = Arc<dyn Fn() + Send + Sync>;
pub type DiagnosticsHandle = Arc<Diagnostics>;

#[derive(Default)]
pub struct Diagnostics {
    sinks: Mutex<Vec<Sink>>,
    cleanups: Mutex<Vec<Cleanup>>,
    warned_unsinked: AtomicBool,
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("sinks", &lock(&self.sinks).len())
            .field("cleanups", &lock(&self.cleanups).len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Diagnostics {
    /// The process-wide registry.
    pub fn global() -> DiagnosticsHandle {
        static GLOBAL: OnceLock<DiagnosticsHandle> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Diagnostics::default())).clone()
    }

    /// A private registry, for tests and harness runs.
    pub fn isolated() -> DiagnosticsHandle {
        Arc::new(Diagnostics::default())
    }

    pub fn register_sink(&self, sink: Sink) {
        lock(&self.sinks).push(sink);
    }

    pub fn unregister_sink(&self, sink: &Sink) {
        let mut sinks = lock(&self.sinks);
        if let Some(pos) = sinks.iter().position(|registered| Arc::ptr_eq(registered, sink)) {
            sinks.remove(pos);
        }
    }

    pub fn register_cleanup(&self, cleanup: Cleanup) {
        lock(&self.cleanups).push(cleanup);
    }

    pub fn unregister_cleanup(&self, cleanup: &Cleanup) {
        let mut cleanups = lock(&self.cleanups);
        if let Some(pos) = cleanups.iter().position(|registered| Arc::ptr_eq(registered, cleanup)) {
            cleanups.remove(pos);
        }
    }

    pub fn sink_count(&self) -> usize {
        lock(&self.sinks).len()
    }

    pub fn record(&self, section: &str, level: Level, message: &str) {
        // Sinks may record themselves; never call them with the lock held.
        let sinks = lock(&self.sinks).clone();
        if sinks.is_empty() {
            if !self.warned_unsinked.swap(true, Ordering::Relaxed) {
                eprintln!(
                    "\nWARNING: A log message was recorded, but no sink is registered.\n         (there will be no further warnings)\n"
                );
            }
            return;
        }
        for sink in &sinks {
            sink(section, level, message);
        }
    }

    pub fn warning(&self, message: &str) {
        self.record(RULES_SECTION, Level::Warning, message);
    }

    pub fn error(&self, message: &str) {
        self.record(RULES_SECTION, Level::Error, message);
    }

    pub fn info(&self, message: &str) {
        self.record(RULES_SECTION, Level::Info, message);
    }

    pub fn cleanup(&self) {
        let cleanups = lock(&self.cleanups).clone();
        for cleanup in &cleanups {
            cleanup();
        }
    }
}

/// Forwards records into `tracing`, keeping the section as a field.
pub fn tracing_sink() -> Sink {
    Arc::new(|section: &str, level: Level, message: &str| match level {
        Level::Debug => tracing::debug!(section, "{message}"),
        Level::Info | Level::Notice => tracing::info!(section, "{message}"),
        Level::Warning => tracing::warn!(section, "{message}"),
        Level::Error | Level::Fatal => tracing::error!(section, "{message}"),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub section: String,
    pub level: Level,
    pub message: String,
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.section, self.level, self.message)
    }
}

/// Collects records in memory; used by the harness and tests.
#[derive(Debug, Clone, Default)]
pub struct RecordBuffer {
    records: Arc<Mutex<Vec<Record>>>,
}

impl RecordBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> Sink {
        let records = self.records.clone();
        Arc::new(move |section: &str, level: Level, message: &str| {
            lock(&records).push(Record { section: section.to_string(), level, message: message.to_string() });
        })
    }

    pub fn take(&self) -> Vec<Record> {
        std::mem::take(&mut *lock(&self.records))
    }

    pub fn snapshot(&self) -> Vec<Record> {
        lock(&self.records).clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        lock(&self.records).iter().any(|record| record.message.contains(needle))
    }

    pub fn count_at(&self, level: Level) -> usize {
        lock(&self.records).iter().filter(|record| record.level == level).count()
    }
}
