use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tapwire_protocol::{Phase, ProxyErrorPayload, RequestId, RouteHandlerId};
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// A callback returned an error or panicked. `deferred` is set when it
    /// ran as a continuation for a later phase.
    Handler { message: String, deferred: bool },
    DuplicateAwait { phase: Phase },
    /// The proxy reported the request as failed.
    Proxy(ProxyErrorPayload),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Handler { message, .. } => f.write_str(message),
            FailureCause::DuplicateAwait { phase } => {
                write!(f, "a continuation is already pending for {phase}")
            }
            FailureCause::Proxy(error) => write!(f, "{error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub request_id: RequestId,
    pub route_handler_id: RouteHandlerId,
    pub phase: Phase,
    pub cause: FailureCause,
    pub reported_at: u64,
    pub observed_at: String,
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (route {}, phase {})",
            self.cause, self.route_handler_id, self.phase
        )
    }
}

/// Receives failure records at any time, including after the test step that
/// caused them has returned.
pub trait FailureReporter: Send + Sync {
    fn report(&self, record: FailureRecord);
}

/// Monotonic tick advanced once per processed proxy event.
#[derive(Debug, Default)]
pub struct DeliveryClock {
    ticks: u64,
}

impl DeliveryClock {
    pub fn tick(&mut self) -> u64 {
        self.ticks += 1;
        self.ticks
    }

    pub fn now(&self) -> u64 {
        self.ticks
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct TestFailure {
    pub message: String,
    pub records: Vec<FailureRecord>,
}

/// Append-only failure log folded into a pass/fail verdict.
#[derive(Debug, Clone, Default)]
pub struct Verdict {
    inner: Arc<VerdictInner>,
}

#[derive(Debug, Default)]
struct VerdictInner {
    records: Mutex<Vec<FailureRecord>>,
    arrived: Notify,
}

impl Verdict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<FailureRecord> {
        self.inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_failed(&self) -> bool {
        !self
            .inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Fails with the first reported record's message.
    pub fn check(&self) -> Result<(), TestFailure> {
        let records = self.records();
        match records.first() {
            None => Ok(()),
            Some(first) => Err(TestFailure {
                message: first.to_string(),
                records,
            }),
        }
    }

    /// Waits until no record has arrived for `quiet`.
    pub async fn settle(&self, quiet: Duration) {
        loop {
            let arrived = self.inner.arrived.notified();
            if tokio::time::timeout(quiet, arrived).await.is_err() {
                return;
            }
        }
    }
}

impl FailureReporter for Verdict {
    fn report(&self, record: FailureRecord) {
        self.inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        self.inner.arrived.notify_waiters();
    }
}
