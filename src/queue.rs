use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::event::Event;
use crate::stats::DaemonStats;

/// Default bound on queued events.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 2000;

/// Error returned when a producer cannot enqueue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("event queue full (capacity {capacity}, oldest queued at {oldest_timestamp_ns} ns)")]
    Full {
        capacity: usize,
        oldest_timestamp_ns: i64,
    },
}

/// Slot in the queue. The wakeup marker is never handed to sinks.
#[derive(Debug)]
pub(crate) enum QueueEntry {
    Event(Event),
    Wakeup,
}

/// Bounded multi-producer/single-consumer event queue.
///
/// Producers never block; the consumer parks in [`wait_pop`](Self::wait_pop).
pub struct EventQueue {
    capacity: usize,
    buffer: Mutex<VecDeque<QueueEntry>>,
    cv: Condvar,
    stats: Arc<DaemonStats>,
}

impl EventQueue {
    pub fn new(capacity: usize, stats: Arc<DaemonStats>) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            cv: Condvar::new(),
            stats,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.lock()
            .iter()
            .filter(|entry| matches!(entry, QueueEntry::Event(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueues `event` and returns its timestamp. A full queue rejects the event
    /// and records the overflow.
    pub fn push(&self, event: Event) -> Result<i64, QueueError> {
        let timestamp = event.elapsed_ns();
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            let oldest_timestamp_ns = guard
                .iter()
                .find_map(|entry| match entry {
                    QueueEntry::Event(event) => Some(event.elapsed_ns()),
                    QueueEntry::Wakeup => None,
                })
                .unwrap_or_default();
            drop(guard);
            self.stats.note_event_queue_overflow(oldest_timestamp_ns);
            return Err(QueueError::Full {
                capacity: self.capacity,
                oldest_timestamp_ns,
            });
        }
        guard.push_back(QueueEntry::Event(event));
        self.cv.notify_one();
        Ok(timestamp)
    }

    /// Appends the shutdown marker. It ignores the capacity bound so a full
    /// queue cannot keep the consumer parked.
    pub(crate) fn push_wakeup(&self) {
        self.lock().push_back(QueueEntry::Wakeup);
        self.cv.notify_one();
    }

    /// Blocks until an event is available and returns it in FIFO order.
    pub fn wait_pop(&self) -> Event {
        loop {
            if let QueueEntry::Event(event) = self.wait_entry() {
                return event;
            }
        }
    }

    /// Like [`wait_pop`](Self::wait_pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Event> {
        let guard = self.lock();
        let (mut guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |buffer| {
                !buffer.iter().any(|entry| matches!(entry, QueueEntry::Event(_)))
            })
            .unwrap_or_else(PoisonError::into_inner);
        let position = guard
            .iter()
            .position(|entry| matches!(entry, QueueEntry::Event(_)))?;
        match guard.remove(position) {
            Some(QueueEntry::Event(event)) => Some(event),
            _ => None,
        }
    }

    pub(crate) fn wait_entry(&self) -> QueueEntry {
        let mut guard = self.lock();
        loop {
            if let Some(entry) = guard.pop_front() {
                return entry;
            }
            guard = self.cv.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueueEntry>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
