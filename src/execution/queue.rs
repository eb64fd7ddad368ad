use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::logging;
use crate::models::SignalDecision;

/// Hand-off between signal detection and order execution
///
/// Signals for one symbol leave the queue in the order they were pushed, and
/// only one of them is out at a time: `pop` skips symbols that are still
/// leased to a worker.
pub struct SignalQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    max_pending_per_symbol: usize,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<SignalDecision>,
    in_flight: HashSet<String>,
    closed: bool,
}

/// A popped signal. Its symbol stays claimed until the lease is dropped.
pub struct SignalLease {
    signal: SignalDecision,
    queue: Arc<SignalQueue>,
}

impl SignalLease {
    pub fn signal(&self) -> &SignalDecision {
        &self.signal
    }
}

impl Deref for SignalLease {
    type Target = SignalDecision;

    fn deref(&self) -> &SignalDecision {
        &self.signal
    }
}

impl Drop for SignalLease {
    fn drop(&mut self) {
        self.queue.state.lock().in_flight.remove(&self.signal.symbol);
        self.queue.notify.notify_waiters();
    }
}

impl SignalQueue {
    pub fn new(max_pending_per_symbol: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            max_pending_per_symbol: max_pending_per_symbol.max(1),
        }
    }

    /// Enqueue a signal. Returns false once the queue is closed.
    ///
    /// When the symbol already has `max_pending_per_symbol` signals waiting,
    /// the oldest of them is dropped to make room.
    pub fn push(&self, signal: SignalDecision) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                tracing::warn!(
                    target: logging::TRADE_PROCESSOR,
                    symbol = %signal.symbol, signal_id = %signal.id,
                    "queue closed, signal rejected"
                );
                return false;
            }

            let waiting = state
                .pending
                .iter()
                .filter(|s| s.symbol == signal.symbol)
                .count();
            let oldest = state.pending.iter().position(|s| s.symbol == signal.symbol);
            if waiting >= self.max_pending_per_symbol {
                if let Some(dropped) = oldest.and_then(|index| state.pending.remove(index)) {
                    tracing::warn!(
                        target: logging::ERROR,
                        symbol = %dropped.symbol, signal_id = %dropped.id,
                        "{} signals pending, dropping oldest from {}",
                        waiting, dropped.signal_time
                    );
                }
            }

            state.pending.push_back(signal);
        }
        self.notify.notify_waiters();
        true
    }

    /// Wait for the next signal whose symbol has nothing in flight
    ///
    /// Returns None once the queue is closed.
    pub async fn pop(self: &Arc<Self>) -> Option<SignalLease> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }

                let next = state
                    .pending
                    .iter()
                    .position(|s| !state.in_flight.contains(&s.symbol));
                let popped = next.and_then(|index| state.pending.remove(index));
                if let Some(signal) = popped {
                    state.in_flight.insert(signal.symbol.clone());
                    return Some(SignalLease {
                        signal,
                        queue: Arc::clone(self),
                    });
                }
            }

            notified.await;
        }
    }

    /// Stop handing out signals. Pending signals are discarded; leases already
    /// out are unaffected. Returns how many were discarded.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            state.closed = true;
            let discarded = state.pending.len();
            state.pending.clear();
            discarded
        };
        self.notify.notify_waiters();

        if discarded > 0 {
            tracing::info!(
                target: logging::TRADE_PROCESSOR,
                "queue closed with {} pending signals discarded",
                discarded
            );
        }
        discarded
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Signals waiting, not counting leased ones
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}
