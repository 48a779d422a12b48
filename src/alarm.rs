//! Nearest-deadline tracking for the anomaly and periodic alarm kinds.
//!
//! A monitor keeps every scheduled alarm locally and registers only the nearest
//! deadline with the companion. Small moves of the nearest deadline (within the
//! configured minimum diff) do not produce companion traffic.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::companion::StatsCompanion;
use crate::stats::DaemonStats;

/// Minimum move of the nearest deadline that triggers re-registration.
pub const DEFAULT_MIN_ALARM_DIFF_SECS: u32 = 5;

const MS_PER_SEC: i64 = 1_000;

/// Which of the two independent alarm monitors an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AlarmKind {
    Anomaly,
    Periodic,
}

impl AlarmKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlarmKind::Anomaly => "anomaly",
            AlarmKind::Periodic => "periodic",
        }
    }
}

impl fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-chosen identity of a scheduled alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AlarmHandle(u64);

impl AlarmHandle {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AlarmError {
    #[error("alarm deadline must be at least 1 second (got {0})")]
    InvalidDeadline(u32),
}

#[derive(Default)]
struct MonitorState {
    deadlines: HashMap<AlarmHandle, u32>,
    ordered: BTreeSet<(u32, AlarmHandle)>,
    registered_sec: Option<u32>,
    companion: Option<Arc<dyn StatsCompanion>>,
}

impl MonitorState {
    fn nearest(&self) -> Option<u32> {
        self.ordered.first().map(|(deadline, _)| *deadline)
    }

    fn remove(&mut self, handle: AlarmHandle) -> Option<u32> {
        let deadline = self.deadlines.remove(&handle)?;
        self.ordered.remove(&(deadline, handle));
        Some(deadline)
    }
}

/// One alarm monitor. Every mutation and every companion call happens under
/// the monitor's own mutex.
pub struct AlarmMonitor {
    kind: AlarmKind,
    min_diff_secs: u32,
    state: Mutex<MonitorState>,
    stats: Arc<DaemonStats>,
}

impl AlarmMonitor {
    pub fn new(kind: AlarmKind, min_diff_secs: u32, stats: Arc<DaemonStats>) -> Self {
        Self {
            kind,
            min_diff_secs,
            state: Mutex::new(MonitorState::default()),
            stats,
        }
    }

    pub fn kind(&self) -> AlarmKind {
        self.kind
    }

    pub fn min_diff_secs(&self) -> u32 {
        self.min_diff_secs
    }

    /// Schedules `handle` at `deadline_sec`, replacing any earlier deadline of
    /// the same handle.
    pub fn set(&self, deadline_sec: u32, handle: AlarmHandle) -> Result<(), AlarmError> {
        if deadline_sec < 1 {
            warn!(kind = %self.kind, handle = handle.id(), "rejecting alarm with zero deadline");
            return Err(AlarmError::InvalidDeadline(deadline_sec));
        }
        let mut state = self.lock();
        state.remove(handle);
        state.deadlines.insert(handle, deadline_sec);
        state.ordered.insert((deadline_sec, handle));
        self.sync_registration(&mut state);
        Ok(())
    }

    /// Removes `handle`; returns whether it was scheduled.
    pub fn cancel(&self, handle: AlarmHandle) -> bool {
        let mut state = self.lock();
        if state.remove(handle).is_none() {
            return false;
        }
        self.sync_registration(&mut state);
        true
    }

    /// Removes and returns every alarm due at or before `now_sec`, nearest first.
    pub fn pop_sooner_than(&self, now_sec: u32) -> Vec<AlarmHandle> {
        let mut state = self.lock();
        let mut due = Vec::new();
        while let Some(&(deadline, handle)) = state.ordered.first() {
            if deadline > now_sec {
                break;
            }
            state.remove(handle);
            due.push(handle);
        }
        if !due.is_empty() {
            match state.nearest() {
                Some(nearest) => self.register(&mut state, nearest),
                None => self.unregister(&mut state),
            }
        }
        due
    }

    /// Swaps the companion. Attaching one re-registers the nearest deadline.
    pub fn set_companion(&self, companion: Option<Arc<dyn StatsCompanion>>) {
        let mut state = self.lock();
        let attached = companion.is_some();
        state.companion = companion;
        if !attached {
            debug!(kind = %self.kind, "alarm monitor detached from companion");
            return;
        }
        if let Some(nearest) = state.nearest() {
            self.register(&mut state, nearest);
        }
    }

    /// Deadline currently registered with the companion, if any.
    pub fn registered_deadline(&self) -> Option<u32> {
        self.lock().registered_sec
    }

    pub fn nearest_deadline(&self) -> Option<u32> {
        self.lock().nearest()
    }

    pub fn len(&self) -> usize {
        self.lock().deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_companion(&self) -> bool {
        self.lock().companion.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sync_registration(&self, state: &mut MonitorState) {
        let Some(nearest) = state.nearest() else {
            if state.registered_sec.is_some() {
                self.unregister(state);
            }
            return;
        };
        let moved = match state.registered_sec {
            None => true,
            Some(registered) => registered.abs_diff(nearest) > self.min_diff_secs,
        };
        if moved {
            self.register(state, nearest);
        }
    }

    fn register(&self, state: &mut MonitorState, deadline_sec: u32) {
        state.registered_sec = Some(deadline_sec);
        self.stats.note_registered_alarm_changed(self.kind);
        let Some(companion) = state.companion.as_ref() else {
            return;
        };
        let deadline_ms = i64::from(deadline_sec) * MS_PER_SEC;
        debug!(kind = %self.kind, deadline_ms, "registering alarm with companion");
        if let Err(err) = companion.register_alarm(self.kind, deadline_ms) {
            warn!(kind = %self.kind, error = %err, "failed to register alarm");
        }
    }

    fn unregister(&self, state: &mut MonitorState) {
        state.registered_sec = None;
        self.stats.note_registered_alarm_changed(self.kind);
        let Some(companion) = state.companion.as_ref() else {
            return;
        };
        debug!(kind = %self.kind, "cancelling alarm with companion");
        if let Err(err) = companion.cancel_alarm(self.kind) {
            warn!(kind = %self.kind, error = %err, "failed to cancel alarm");
        }
    }
}
