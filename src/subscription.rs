//! Live subscriptions: external readers that receive a filtered copy of the
//! event stream in batches.

use crossbeam_queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info};

use crate::event::Event;
use crate::pump::EventSink;

pub const DEFAULT_SUBSCRIPTION_BUFFER_CAPACITY: usize = 256;
pub const MAX_SUBSCRIPTIONS: usize = 20;

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("malformed subscription config: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("subscription must name at least one atom")]
    NoAtoms,
    #[error("subscription limit of {0} reached")]
    TooMany(usize),
}

/// What a subscriber asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub atom_ids: BTreeSet<u32>,
}

impl SubscriptionConfig {
    pub fn parse(bytes: &[u8]) -> Result<Self, SubscriptionError> {
        let config: Self = serde_json::from_slice(bytes)?;
        if config.atom_ids.is_empty() {
            return Err(SubscriptionError::NoAtoms);
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Why a batch is being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryReason {
    BufferFull,
    FlushRequested,
    SubscriptionEnded,
}

/// Receiver of subscription batches. Called from the pump thread for full
/// buffers, so implementations must not block.
pub trait SubscriptionCallback: Send + Sync {
    fn on_subscription_data(&self, reason: DeliveryReason, events: Vec<Event>);
}

struct Subscription {
    config: SubscriptionConfig,
    buffer: ArrayQueue<Event>,
    callback: Arc<dyn SubscriptionCallback>,
}

impl Subscription {
    fn drain(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.buffer.len());
        while let Some(event) = self.buffer.pop() {
            events.push(event);
        }
        events
    }

    fn deliver(&self, reason: DeliveryReason) {
        let events = self.drain();
        self.callback.on_subscription_data(reason, events);
    }
}

/// Secondary event sink fanning events out to live subscribers.
pub struct SubscriptionHub {
    buffer_capacity: usize,
    next_id: AtomicU64,
    subscriptions: RwLock<BTreeMap<SubscriptionId, Arc<Subscription>>>,
}

impl SubscriptionHub {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            buffer_capacity: buffer_capacity.max(1),
            next_id: AtomicU64::new(1),
            subscriptions: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn subscribe(
        &self,
        config: SubscriptionConfig,
        callback: Arc<dyn SubscriptionCallback>,
    ) -> Result<SubscriptionId, SubscriptionError> {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if subscriptions.len() >= MAX_SUBSCRIPTIONS {
            return Err(SubscriptionError::TooMany(MAX_SUBSCRIPTIONS));
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(id = id.get(), atoms = config.atom_ids.len(), "subscription added");
        subscriptions.insert(
            id,
            Arc::new(Subscription {
                config,
                buffer: ArrayQueue::new(self.buffer_capacity),
                callback,
            }),
        );
        Ok(id)
    }

    /// Ends a subscription, delivering whatever it still buffers.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        let Some(subscription) = removed else {
            return false;
        };
        info!(id = id.get(), "subscription removed");
        subscription.deliver(DeliveryReason::SubscriptionEnded);
        true
    }

    /// Delivers the buffered events of `id` now.
    pub fn flush(&self, id: SubscriptionId) -> bool {
        let Some(subscription) = self.get(id) else {
            return false;
        };
        subscription.deliver(DeliveryReason::FlushRequested);
        true
    }

    pub fn len(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn interested(&self, atom_id: u32) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|subscription| subscription.config.atom_ids.contains(&atom_id))
            .cloned()
            .collect()
    }
}

impl EventSink for SubscriptionHub {
    fn name(&self) -> &str {
        "subscriptions"
    }

    fn on_event(&self, event: &Event) {
        for subscription in self.interested(event.atom_id()) {
            let mut pending = event.clone();
            loop {
                match subscription.buffer.push(pending) {
                    Ok(()) => break,
                    Err(rejected) => {
                        debug!(atom_id = event.atom_id(), "subscription buffer full; delivering");
                        subscription.deliver(DeliveryReason::BufferFull);
                        pending = rejected;
                    }
                }
            }
        }
    }
}
