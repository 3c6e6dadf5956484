//! Poll context and diagnostics sink
//!
//! The context is created by the caller and handed explicitly to the
//! poller, the coordinator and the engine. There is no process-wide state.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

pub type Shared<T> = Arc<Mutex<T>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Connection,
    Protocol,
    Decode,
    UnknownDataType,
}

/// One recovered failure, kept for the cycle summary.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub device_id: i64,
    pub address: Option<u16>,
    pub kind: DiagnosticKind,
    pub message: String,
}

/// Collects recovered failures and mirrors them to the log.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    entries: Shared<Vec<Diagnostic>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        device_id: i64,
        address: Option<u16>,
        kind: DiagnosticKind,
        message: impl Into<String>,
    ) {
        let message = message.into();
        match address {
            Some(addr) => warn!(device_id, register = addr, ?kind, "{}", message),
            None => warn!(device_id, ?kind, "{}", message),
        }
        self.entries.lock().push(Diagnostic { device_id, address, kind, message });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Empties the sink, returning what was recorded since the last drain.
    pub fn drain(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub fn count_of(&self, kind: DiagnosticKind) -> usize {
        self.entries.lock().iter().filter(|d| d.kind == kind).count()
    }
}

/// Settings and sinks shared by every stage of a poll cycle.
#[derive(Debug, Clone)]
pub struct PollContext {
    /// Devices polled at the same time. 1 keeps the sequential behavior.
    pub concurrency: usize,
    pub diagnostics: Diagnostics,
}

impl Default for PollContext {
    fn default() -> Self {
        Self {
            concurrency: 1,
            diagnostics: Diagnostics::new(),
        }
    }
}

impl PollContext {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}
