//! Per-correlation aggregation state: the counters, the event channel, and
//! the cancellation capabilities for the dispatch group and the deadline.

use crate::deadline::DeadlineHandle;
use crate::errors::AggregatorError;
use crate::protocol::{CallbackStatus, JournalCallback};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Bound on the per-correlation event channel. Producers apply bounded
/// retry on top (see `emitter`), so a slow subscriber loses events instead
/// of wedging the callback path.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Outcome of recording one callback against the expected total.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordDecision {
    Continue,
    /// This producer observed the crossing; it owns termination.
    Terminate,
}

pub struct AggregationSink {
    tx: Mutex<Option<mpsc::Sender<JournalCallback>>>,
    rx: Mutex<Option<mpsc::Receiver<JournalCallback>>>,
    /// 0 means "not yet set"; the dispatch count is always >= 1.
    expected: AtomicU32,
    received: AtomicU32,
    respondents: AtomicU32,
    errors: AtomicU32,
    created_at: Instant,
    dispatch_cancel: Mutex<Option<AbortHandle>>,
    deadline: Mutex<Option<DeadlineHandle>>,
}

impl AggregationSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            expected: AtomicU32::new(0),
            received: AtomicU32::new(0),
            respondents: AtomicU32::new(0),
            errors: AtomicU32::new(0),
            created_at: Instant::now(),
            dispatch_cancel: Mutex::new(None),
            deadline: Mutex::new(None),
        }
    }

    /// Time since this correlation was registered.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Sets the expected callback total exactly once. Because dispatch
    /// starts before this is called, synthetics may already have been
    /// recorded; the crossing is re-checked after the store so early
    /// arrivals are never lost.
    pub fn set_expected(&self, n: u32) -> Result<RecordDecision, AggregatorError> {
        if n == 0 {
            return Err(AggregatorError::InvalidState(
                "expected callback count must be at least 1".to_string(),
            ));
        }
        if let Err(prev) = self
            .expected
            .compare_exchange(0, n, Ordering::SeqCst, Ordering::SeqCst)
        {
            return Err(AggregatorError::InvalidState(format!(
                "expected already set to {prev}"
            )));
        }

        if self.received.load(Ordering::SeqCst) >= n {
            Ok(RecordDecision::Terminate)
        } else {
            Ok(RecordDecision::Continue)
        }
    }

    /// Compare-and-act primitive: counts one callback and decides whether
    /// it completed the correlation. The status counter is bumped before
    /// `received` so the tally is consistent at the crossing. Exactly one
    /// producer lands on `expected`; over-delivery from duplicates returns
    /// `Continue` and is discarded later by the registry's atomic remove.
    pub fn record(&self, status: CallbackStatus) -> RecordDecision {
        match status {
            CallbackStatus::Ok => {
                self.respondents.fetch_add(1, Ordering::SeqCst);
            }
            s if s.is_technical_failure() => {
                self.errors.fetch_add(1, Ordering::SeqCst);
            }
            // REJECTED counts toward received only
            _ => {}
        }

        let received = self.received.fetch_add(1, Ordering::SeqCst) + 1;
        let expected = self.expected.load(Ordering::SeqCst);
        if expected > 0 && received == expected {
            RecordDecision::Terminate
        } else {
            RecordDecision::Continue
        }
    }

    pub fn expected(&self) -> u32 {
        self.expected.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> u32 {
        self.received.load(Ordering::SeqCst)
    }

    pub fn respondents(&self) -> u32 {
        self.respondents.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> u32 {
        self.errors.load(Ordering::SeqCst)
    }

    /// Clone of the event-channel sender, or None once the channel has
    /// been closed by termination.
    pub fn sender(&self) -> Option<mpsc::Sender<JournalCallback>> {
        self.tx.lock().clone()
    }

    /// Hands out the single subscriber end. A second call returns None,
    /// which the stream endpoint maps to Conflict.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<JournalCallback>> {
        self.rx.lock().take()
    }

    /// Drops the sender so the subscriber sees end-of-stream once buffered
    /// events are drained. Emits after this point fail fast.
    pub fn close_channel(&self) {
        self.tx.lock().take();
    }

    pub fn arm_dispatch_cancel(&self, handle: AbortHandle) {
        *self.dispatch_cancel.lock() = Some(handle);
    }

    pub fn arm_deadline(&self, handle: DeadlineHandle) {
        *self.deadline.lock() = Some(handle);
    }

    /// Cancels a still-pending deadline; safe after it has fired.
    pub fn cancel_deadline(&self) {
        if let Some(handle) = self.deadline.lock().take() {
            handle.cancel();
        }
    }

    /// Invokes both cancellation capabilities if armed. Used on client
    /// disconnect and shutdown; safe to call after either has fired.
    pub fn cancel_all(&self) {
        if let Some(handle) = self.dispatch_cancel.lock().take() {
            handle.abort();
        }
        self.cancel_deadline();
    }
}
