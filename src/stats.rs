use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::alarm::AlarmKind;

/// Number of companion-death timestamps retained for diagnostics.
pub const MAX_COMPANION_DEATH_HISTORY: usize = 20;

/// Daemon-wide guardrail counters.
///
/// Constructed once by the service and handed to each component as an `Arc`, so
/// tests can build isolated instances.
#[derive(Debug, Default)]
pub struct DaemonStats {
    events_dispatched: AtomicU64,
    event_queue_overflows: AtomicU64,
    sink_panics: AtomicU64,
    anomaly_alarm_changes: AtomicU64,
    periodic_alarm_changes: AtomicU64,
    readiness_fired: AtomicU64,
    readiness_cancelled: AtomicU64,
    access_rejections: AtomicU64,
    storage_failures: AtomicU64,
    companion_deaths: Mutex<VecDeque<i64>>,
    last_overflow_oldest_ns: AtomicU64,
}

impl DaemonStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_event_dispatched(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a push rejected by a full queue, keeping the oldest queued timestamp.
    pub fn note_event_queue_overflow(&self, oldest_queued_ns: i64) {
        self.event_queue_overflows.fetch_add(1, Ordering::Relaxed);
        self.last_overflow_oldest_ns
            .store(oldest_queued_ns.max(0) as u64, Ordering::Relaxed);
    }

    pub fn note_sink_panic(&self) {
        self.sink_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_registered_alarm_changed(&self, kind: AlarmKind) {
        let counter = match kind {
            AlarmKind::Anomaly => &self.anomaly_alarm_changes,
            AlarmKind::Periodic => &self.periodic_alarm_changes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_readiness_fired(&self) {
        self.readiness_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_readiness_cancelled(&self) {
        self.readiness_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_access_rejected(&self) {
        self.access_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_storage_failure(&self) {
        self.storage_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a companion restart at `wall_sec`.
    pub fn note_companion_death(&self, wall_sec: i64) {
        let mut deaths = self
            .companion_deaths
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        deaths.push_back(wall_sec);
        while deaths.len() > MAX_COMPANION_DEATH_HISTORY {
            deaths.pop_front();
        }
    }

    pub fn events_dispatched(&self) -> u64 {
        self.events_dispatched.load(Ordering::Relaxed)
    }

    pub fn event_queue_overflows(&self) -> u64 {
        self.event_queue_overflows.load(Ordering::Relaxed)
    }

    pub fn sink_panics(&self) -> u64 {
        self.sink_panics.load(Ordering::Relaxed)
    }

    pub fn registered_alarm_changes(&self, kind: AlarmKind) -> u64 {
        match kind {
            AlarmKind::Anomaly => self.anomaly_alarm_changes.load(Ordering::Relaxed),
            AlarmKind::Periodic => self.periodic_alarm_changes.load(Ordering::Relaxed),
        }
    }

    pub fn companion_deaths(&self) -> Vec<i64> {
        self.companion_deaths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_dispatched: self.events_dispatched(),
            event_queue_overflows: self.event_queue_overflows(),
            last_overflow_oldest_ns: self.last_overflow_oldest_ns.load(Ordering::Relaxed),
            sink_panics: self.sink_panics(),
            anomaly_alarm_changes: self.registered_alarm_changes(AlarmKind::Anomaly),
            periodic_alarm_changes: self.registered_alarm_changes(AlarmKind::Periodic),
            readiness_fired: self.readiness_fired.load(Ordering::Relaxed),
            readiness_cancelled: self.readiness_cancelled.load(Ordering::Relaxed),
            access_rejections: self.access_rejections.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
            companion_death_wall_secs: self.companion_deaths(),
        }
    }

    /// JSON rendering of [`snapshot`](Self::snapshot), served by metadata queries.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.snapshot())
    }
}

/// Serializable view of [`DaemonStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub events_dispatched: u64,
    pub event_queue_overflows: u64,
    pub last_overflow_oldest_ns: u64,
    pub sink_panics: u64,
    pub anomaly_alarm_changes: u64,
    pub periodic_alarm_changes: u64,
    pub readiness_fired: u64,
    pub readiness_cancelled: u64,
    pub access_rejections: u64,
    pub storage_failures: u64,
    pub companion_death_wall_secs: Vec<i64>,
}
