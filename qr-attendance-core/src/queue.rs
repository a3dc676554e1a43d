//! Ingest queue between producers and the delivery worker
//!
//! Unbounded FIFO with a blocking `pop` for the single consumer. Producers
//! never wait on the consumer: `push` only takes the internal lock.
//!
//! Each entry remembers whether it came from a producer or was read back
//! from the fallback file, so the worker can tell which cycles were started
//! by new input.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::record::Record;

/// Where a queued record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Pushed by a producer
    Live,
    /// Read back from the fallback file
    Fallback,
}

/// A record waiting for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRecord {
    pub record: Record,
    pub origin: Origin,
}

/// Cloneable handle to a shared record queue
#[derive(Clone, Default)]
pub struct IngestQueue {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    /// Signalled when an item is pushed or the queue is closed
    available: Condvar,
    /// Signalled when the last unfinished item is marked done
    drained: Condvar,
}

#[derive(Default)]
struct State {
    items: VecDeque<QueuedRecord>,
    /// Pushed items not yet marked done
    unfinished: usize,
    closed: bool,
}

impl IngestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a producer's record at the back. Never blocks on the consumer.
    pub fn push(&self, record: Record) {
        self.enqueue(record, Origin::Live);
    }

    /// Append a record recovered from the fallback file. Accepted even after
    /// [`close`](Self::close) so the worker can requeue while draining.
    pub fn requeue(&self, record: Record) {
        self.enqueue(record, Origin::Fallback);
    }

    fn enqueue(&self, record: Record, origin: Origin) {
        let mut state = self.lock();
        state.items.push_back(QueuedRecord { record, origin });
        state.unfinished += 1;
        drop(state);
        self.shared.available.notify_one();
    }

    /// Block until a record is available.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub fn pop(&self) -> Option<QueuedRecord> {
        let mut state = self.lock();
        loop {
            if let Some(entry) = state.items.pop_front() {
                return Some(entry);
            }
            if state.closed {
                return None;
            }
            state = self
                .shared
                .available
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Mark one popped record as fully processed
    pub fn task_done(&self) {
        let mut state = self.lock();
        state.unfinished = state.unfinished.saturating_sub(1);
        if state.unfinished == 0 {
            self.shared.drained.notify_all();
        }
    }

    /// Wait until every pushed record has been popped and marked done.
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.unfinished > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .shared
                .drained
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = next;
        }
        true
    }

    /// Stop waiting consumers once the remaining records are popped
    pub fn close(&self) {
        self.lock().closed = true;
        self.shared.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Records waiting to be popped
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A panic while holding the lock cannot leave the deque half-updated,
    // so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}
