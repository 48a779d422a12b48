//! Handle to the companion process that owns wall-clock alarms.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

use crate::alarm::AlarmKind;

/// Failure of an outbound companion call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompanionError {
    #[error("companion is unreachable: {0}")]
    Unreachable(String),
}

/// Liveness callback handed to the transport; invoked once the companion dies.
pub struct DeathRecipient {
    notify: Box<dyn Fn() + Send + Sync>,
}

impl DeathRecipient {
    pub fn new(notify: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            notify: Box::new(notify),
        }
    }

    pub fn notify(&self) {
        (self.notify)();
    }
}

impl fmt::Debug for DeathRecipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeathRecipient").finish_non_exhaustive()
    }
}

/// Outbound calls the daemon makes to the companion. All of them are
/// best-effort; failures are logged by the caller.
pub trait StatsCompanion: Send + Sync {
    /// Tells the companion the daemon is up and serving.
    fn statsd_ready(&self) -> Result<(), CompanionError>;

    fn register_alarm(&self, kind: AlarmKind, deadline_ms: i64) -> Result<(), CompanionError>;

    fn cancel_alarm(&self, kind: AlarmKind) -> Result<(), CompanionError>;

    /// Arranges for `recipient` to be notified when the companion dies.
    fn link_to_death(&self, recipient: DeathRecipient) -> Result<(), CompanionError> {
        drop(recipient);
        Ok(())
    }
}

/// Single-writer, multi-reader companion holder. Readers clone the `Arc` out
/// and never call the companion while holding the lock.
#[derive(Default)]
pub struct CompanionSlot {
    inner: RwLock<Option<Arc<dyn StatsCompanion>>>,
}

impl CompanionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<dyn StatsCompanion>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, companion: Arc<dyn StatsCompanion>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(companion);
    }

    /// Empties the slot, returning the previous companion.
    pub fn clear(&self) -> Option<Arc<dyn StatsCompanion>> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn is_present(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
