//! Bounded handoff between the event pump thread and the async distributor
//!
//! The pump thread pushes with plain blocking calls; the distributor pops
//! with `.await`. This is the only place state crosses from the worker
//! thread into the runtime.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use panel_bridge_config::BackpressurePolicy;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::warn;

/// Returned by [`EventQueue::push`] once the queue has been closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event queue is closed")]
pub struct QueueClosed;

/// What happened to a pushed event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The event was queued and the oldest queued event discarded
    DroppedOldest,
    /// The queue was full and the pushed event discarded
    DroppedNewest,
}

#[derive(Debug, Default)]
struct State {
    events: VecDeque<Value>,
    closed: bool,
}

#[derive(Debug)]
pub struct EventQueue {
    state: Mutex<State>,
    capacity: usize,
    policy: BackpressurePolicy,
    /// Wakes a producer blocked on a full queue
    not_full: Condvar,
    /// Wakes the consumer
    not_empty: Notify,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                events: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
            }),
            capacity,
            policy,
            not_full: Condvar::new(),
            not_empty: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an event, applying the backpressure policy when full
    ///
    /// With [`BackpressurePolicy::Block`] this blocks the calling thread until
    /// there is room, so it must not be called from the async runtime.
    pub fn push(&self, event: Value) -> Result<PushOutcome, QueueClosed> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueClosed);
        }

        let mut outcome = PushOutcome::Queued;
        if state.events.len() >= self.capacity {
            match self.policy {
                BackpressurePolicy::Block => {
                    while state.events.len() >= self.capacity && !state.closed {
                        state = self
                            .not_full
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    if state.closed {
                        return Err(QueueClosed);
                    }
                }
                BackpressurePolicy::DropOldest => {
                    state.events.pop_front();
                    outcome = PushOutcome::DroppedOldest;
                }
                BackpressurePolicy::DropNewest => {
                    drop(state);
                    self.record_drop();
                    return Ok(PushOutcome::DroppedNewest);
                }
            }
        }

        state.events.push_back(event);
        drop(state);

        if outcome == PushOutcome::DroppedOldest {
            self.record_drop();
        }
        self.not_empty.notify_one();
        Ok(outcome)
    }

    fn record_drop(&self) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped == 1 || dropped % 100 == 0 {
            warn!(
                dropped,
                capacity = self.capacity,
                policy = ?self.policy,
                "Event queue full, dropping events"
            );
        }
    }

    /// Dequeue the oldest event, waiting for one to arrive
    ///
    /// Returns `None` once the queue is closed and drained. Cancel safe.
    pub async fn pop(&self) -> Option<Value> {
        loop {
            let notified = self.not_empty.notified();
            if let Some(event) = self.try_pop() {
                return Some(event);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<Value> {
        let event = self.lock().events.pop_front();
        if event.is_some() {
            self.not_full.notify_one();
        }
        event
    }

    /// Refuse further pushes and wake everyone waiting
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    /// Total events discarded by the backpressure policy
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
