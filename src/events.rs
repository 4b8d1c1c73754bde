//! Structured call events, delivered best-effort to fixed observers.
//!
//! Observers are registered at construction via [`observer`]: the receiver
//! half goes to the consumer, the [`EventSink`] half into the orchestrator
//! builder. Delivery never blocks a call: a saturated observer loses the
//! event and the bus bumps its drop counter instead.

use crate::error::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// One structured event in a call's lifecycle.
///
/// Events for a single request are emitted in strict order:
/// `CallStart` → (`CallRetry`)* → (`CallSuccess` | `CallError`), with
/// `LimiterWait`, `BreakerOpen`, and `BreakerClose` interleaved as the
/// reliability stack acts.
#[derive(Debug, Clone, PartialEq)]
pub enum EventRecord {
    CallStart {
        binding: String,
        request_id: String,
    },
    CallSuccess {
        binding: String,
        request_id: String,
        attempts: u32,
        cost_usd: Option<f64>,
    },
    CallError {
        binding: String,
        request_id: String,
        attempts: u32,
        kind: ErrorKind,
    },
    CallRetry {
        binding: String,
        request_id: String,
        attempt: u32,
        wait: Duration,
        kind: ErrorKind,
    },
    BreakerOpen {
        binding: String,
        failures: usize,
    },
    BreakerClose {
        binding: String,
    },
    LimiterWait {
        binding: String,
        request_id: String,
        wait: Duration,
    },
}

impl EventRecord {
    pub fn binding(&self) -> &str {
        match self {
            EventRecord::CallStart { binding, .. }
            | EventRecord::CallSuccess { binding, .. }
            | EventRecord::CallError { binding, .. }
            | EventRecord::CallRetry { binding, .. }
            | EventRecord::BreakerOpen { binding, .. }
            | EventRecord::BreakerClose { binding }
            | EventRecord::LimiterWait { binding, .. } => binding,
        }
    }
}

/// Sending half of an observer channel; hand it to the orchestrator builder.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<EventRecord>,
}

/// Create an observer channel with the given buffer capacity.
pub fn observer(capacity: usize) -> (EventSink, mpsc::Receiver<EventRecord>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSink { tx }, rx)
}

#[derive(Debug, Default)]
pub(crate) struct EventBus {
    sinks: Vec<EventSink>,
    dropped: AtomicU64,
}

impl EventBus {
    pub(crate) fn new(sinks: Vec<EventSink>) -> Self {
        Self { sinks, dropped: AtomicU64::new(0) }
    }

    pub(crate) fn emit(&self, event: EventRecord) {
        for sink in &self.sinks {
            if sink.tx.try_send(event.clone()).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Events lost to saturated or closed observers since construction.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
