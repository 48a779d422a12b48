//! Aggregation engine contract and the in-memory reference engine.
//!
//! The coordination core never aggregates anything itself. It drives an
//! [`AggregationEngine`] (events, alarms, flushes, snapshot capture/restore) and
//! relies on the engine for the bucket and report semantics. [`InMemoryEngine`]
//! is the small engine the daemon binary and the test-suite run against.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::alarm::AlarmHandle;
use crate::clock::NS_PER_SEC;
use crate::event::Event;
use crate::storage::{SnapshotStore, StorageError, StoredReport};

/// (owning uid, numeric id) naming a registered configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConfigKey {
    uid: u32,
    id: i64,
}

impl ConfigKey {
    pub const fn new(uid: u32, id: i64) -> Self {
        Self { uid, id }
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn id(&self) -> i64 {
        self.id
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {})", self.uid, self.id)
    }
}

/// Why buckets are being flushed or a report is being produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpReason {
    DeviceShutdown,
    CompanionDied,
    TerminationSignalReceived,
    GetDataCalled,
    AdbDump,
}

impl DumpReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DumpReason::DeviceShutdown => "device_shutdown",
            DumpReason::CompanionDied => "companion_died",
            DumpReason::TerminationSignalReceived => "termination_signal_received",
            DumpReason::GetDataCalled => "get_data_called",
            DumpReason::AdbDump => "adb_dump",
        }
    }
}

impl fmt::Display for DumpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much latency a flush may spend pulling fresh data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpLatency {
    Fast,
    NoTimeConstraints,
}

/// Remaining activation time of one metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveMetricRecord {
    pub metric_id: i64,
    pub remaining_ttl_ns: i64,
}

/// Activation state of one configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveConfigRecord {
    pub key: ConfigKey,
    pub metrics: Vec<ActiveMetricRecord>,
}

/// Point-in-time activation state across every configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveConfigsSnapshot {
    pub captured_elapsed_ns: i64,
    pub configs: Vec<ActiveConfigRecord>,
}

/// Refractory period bookkeeping of one alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertMetadataRecord {
    pub alert_id: i64,
    pub refractory_ends_wall_sec: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMetadataRecord {
    pub key: ConfigKey,
    pub alerts: Vec<AlertMetadataRecord>,
}

/// Cross-config metadata that must survive a reset (alert refractory periods).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub captured_wall_ns: i64,
    pub configs: Vec<ConfigMetadataRecord>,
}

/// Errors surfaced by engine operations that callers must see.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown config {0}")]
    UnknownConfig(ConfigKey),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Primary sink and state owner driven by the coordination core.
pub trait AggregationEngine: Send {
    fn on_event(&mut self, event: &Event);

    fn on_periodic_alarm(&mut self, now_ns: i64, fired: &[AlarmHandle]);

    fn on_pull_alarm(&mut self, now_ns: i64);

    /// Invoked once the readiness barrier fires.
    fn on_boot_completed(&mut self, elapsed_ns: i64);

    fn on_config_updated(
        &mut self,
        key: ConfigKey,
        definition: ConfigDefinition,
        elapsed_ns: i64,
    );

    fn on_config_removed(&mut self, key: ConfigKey);

    /// Moves in-flight buckets to durable storage.
    fn flush_to_disk(
        &mut self,
        reason: DumpReason,
        latency: DumpLatency,
        elapsed_ns: i64,
        wall_ns: i64,
    ) -> Result<(), EngineError>;

    fn active_configs_snapshot(&self, elapsed_ns: i64) -> ActiveConfigsSnapshot;

    fn metadata_snapshot(&self, wall_ns: i64, elapsed_ns: i64) -> MetadataSnapshot;

    fn save_active_configs_snapshot(&mut self, elapsed_ns: i64) -> Result<(), EngineError>;

    fn save_metadata_snapshot(&mut self, wall_ns: i64, elapsed_ns: i64)
        -> Result<(), EngineError>;

    fn load_active_configs_snapshot(&mut self, elapsed_ns: i64) -> Result<(), EngineError>;

    fn load_metadata_snapshot(&mut self, wall_ns: i64, elapsed_ns: i64)
        -> Result<(), EngineError>;

    /// Evicts persisted data older than each config's retention window.
    fn enforce_retention(&mut self, wall_ns: i64, elapsed_ns: i64) -> Result<(), EngineError>;

    /// Drops every piece of volatile aggregation state, keeping config definitions.
    fn reset_all_state(&mut self);

    fn restore_active_configs_state(
        &mut self,
        snapshot: &ActiveConfigsSnapshot,
        elapsed_ns: i64,
    );

    fn restore_metadata_state(
        &mut self,
        snapshot: &MetadataSnapshot,
        wall_ns: i64,
        elapsed_ns: i64,
    );

    fn dump_report(
        &mut self,
        key: ConfigKey,
        request: ReportRequest,
    ) -> Result<Vec<u8>, EngineError>;

    /// Ids of the configs owned by `uid` that are active at `elapsed_ns`.
    fn active_configs_for_uid(&self, uid: u32, elapsed_ns: i64) -> Vec<i64>;
}

/// Engine handle shared by the pump thread and the service boundary.
///
/// Holding the lock is what makes a recovery sequence atomic with respect to
/// event ingestion.
pub type SharedEngine = Arc<Mutex<dyn AggregationEngine>>;

/// Wraps a concrete engine into a [`SharedEngine`].
pub fn share<E: AggregationEngine + 'static>(engine: E) -> SharedEngine {
    Arc::new(Mutex::new(engine))
}

/// Parameters of a report dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportRequest {
    pub elapsed_ns: i64,
    pub wall_ns: i64,
    pub include_current_bucket: bool,
    pub erase_data: bool,
    pub reason: DumpReason,
    pub latency: DumpLatency,
}

/// Metric whose collection is switched on for `ttl_secs` by an activation atom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRule {
    pub metric_id: i64,
    pub activation_atom: u32,
    pub ttl_secs: u64,
}

/// Alert raised when an atom's bucket count crosses `threshold`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRule {
    pub alert_id: i64,
    pub atom_id: u32,
    pub threshold: u64,
    pub refractory_secs: u64,
}

/// Parsed configuration understood by [`InMemoryEngine`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDefinition {
    #[serde(default)]
    pub atom_ids: BTreeSet<u32>,
    #[serde(default)]
    pub activations: Vec<ActivationRule>,
    #[serde(default)]
    pub alerts: Vec<AlertRule>,
    /// Age after which persisted reports are evicted; `None` keeps them forever.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl ConfigDefinition {
    /// Parses a serialized definition. Empty input yields an empty definition.
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, Default)]
struct ConfigState {
    definition: ConfigDefinition,
    bucket_start_ns: i64,
    bucket: BTreeMap<u32, u64>,
    activation_expiry_ns: BTreeMap<i64, i64>,
    refractory_ends_wall_sec: BTreeMap<i64, i64>,
}

impl ConfigState {
    fn new(definition: ConfigDefinition, elapsed_ns: i64) -> Self {
        Self {
            definition,
            bucket_start_ns: elapsed_ns,
            ..Self::default()
        }
    }

    fn is_active(&self, elapsed_ns: i64) -> bool {
        self.definition.activations.is_empty()
            || self
                .activation_expiry_ns
                .values()
                .any(|expiry| *expiry > elapsed_ns)
    }

    fn reset(&mut self) {
        self.bucket.clear();
        self.activation_expiry_ns.clear();
        self.refractory_ends_wall_sec.clear();
    }
}

/// Reference engine: per-config atom counters with activations and alerts.
pub struct InMemoryEngine {
    configs: BTreeMap<ConfigKey, ConfigState>,
    store: Arc<dyn SnapshotStore>,
    boot_completed_ns: Option<i64>,
    periodic_fires: u64,
    pull_fires: u64,
}

impl InMemoryEngine {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            configs: BTreeMap::new(),
            store,
            boot_completed_ns: None,
            periodic_fires: 0,
            pull_fires: 0,
        }
    }

    pub fn config_keys(&self) -> Vec<ConfigKey> {
        self.configs.keys().copied().collect()
    }

    /// Count of `atom_id` in the current (unflushed) bucket of `key`.
    pub fn bucket_count(&self, key: ConfigKey, atom_id: u32) -> u64 {
        self.configs
            .get(&key)
            .and_then(|state| state.bucket.get(&atom_id).copied())
            .unwrap_or(0)
    }

    pub fn boot_completed_ns(&self) -> Option<i64> {
        self.boot_completed_ns
    }

    pub fn periodic_fires(&self) -> u64 {
        self.periodic_fires
    }

    pub fn pull_fires(&self) -> u64 {
        self.pull_fires
    }

    fn apply_alerts(state: &mut ConfigState, atom_id: u32, wall_sec: i64) {
        let count = state.bucket.get(&atom_id).copied().unwrap_or(0);
        for alert in state.definition.alerts.iter().filter(|a| a.atom_id == atom_id) {
            if count <= alert.threshold {
                continue;
            }
            let in_refractory = state
                .refractory_ends_wall_sec
                .get(&alert.alert_id)
                .is_some_and(|ends| *ends > wall_sec);
            if in_refractory {
                continue;
            }
            let ends = wall_sec.saturating_add(alert.refractory_secs as i64);
            debug!(alert_id = alert.alert_id, refractory_ends = ends, "anomaly declared");
            state.refractory_ends_wall_sec.insert(alert.alert_id, ends);
        }
    }

    fn take_bucket(
        state: &mut ConfigState,
        key: ConfigKey,
        reason: DumpReason,
        wall_ns: i64,
        elapsed_ns: i64,
    ) -> StoredReport {
        let report = StoredReport {
            key,
            reason,
            bucket_start_ns: state.bucket_start_ns,
            bucket_end_ns: elapsed_ns,
            wall_ns,
            counts: std::mem::take(&mut state.bucket),
        };
        state.bucket_start_ns = elapsed_ns;
        report
    }
}

impl AggregationEngine for InMemoryEngine {
    fn on_event(&mut self, event: &Event) {
        let wall_sec = event.wall_ns() / NS_PER_SEC;
        for state in self.configs.values_mut() {
            for rule in state
                .definition
                .activations
                .iter()
                .filter(|rule| rule.activation_atom == event.atom_id())
            {
                let expiry = event
                    .elapsed_ns()
                    .saturating_add((rule.ttl_secs as i64).saturating_mul(NS_PER_SEC));
                state.activation_expiry_ns.insert(rule.metric_id, expiry);
            }
            if !state.definition.atom_ids.contains(&event.atom_id())
                || !state.is_active(event.elapsed_ns())
            {
                continue;
            }
            *state.bucket.entry(event.atom_id()).or_insert(0) += 1;
            Self::apply_alerts(state, event.atom_id(), wall_sec);
        }
    }

    fn on_periodic_alarm(&mut self, now_ns: i64, fired: &[AlarmHandle]) {
        self.periodic_fires = self.periodic_fires.saturating_add(fired.len() as u64);
        debug!(now_ns, fired = fired.len(), "periodic alarms fired");
    }

    fn on_pull_alarm(&mut self, now_ns: i64) {
        self.pull_fires = self.pull_fires.saturating_add(1);
        debug!(now_ns, "pull alarm fired");
    }

    fn on_boot_completed(&mut self, elapsed_ns: i64) {
        self.boot_completed_ns = Some(elapsed_ns);
    }

    fn on_config_updated(
        &mut self,
        key: ConfigKey,
        definition: ConfigDefinition,
        elapsed_ns: i64,
    ) {
        self.configs
            .insert(key, ConfigState::new(definition, elapsed_ns));
    }

    fn on_config_removed(&mut self, key: ConfigKey) {
        if self.configs.remove(&key).is_some() {
            if let Err(err) = self.store.remove_reports(key) {
                warn!(%key, error = %err, "failed to remove reports of deleted config");
            }
        }
    }

    fn flush_to_disk(
        &mut self,
        reason: DumpReason,
        _latency: DumpLatency,
        elapsed_ns: i64,
        wall_ns: i64,
    ) -> Result<(), EngineError> {
        for (key, state) in self.configs.iter_mut() {
            if state.bucket.is_empty() {
                continue;
            }
            let report = Self::take_bucket(state, *key, reason, wall_ns, elapsed_ns);
            self.store.write_report(&report)?;
        }
        Ok(())
    }

    fn active_configs_snapshot(&self, elapsed_ns: i64) -> ActiveConfigsSnapshot {
        let configs = self
            .configs
            .iter()
            .filter_map(|(key, state)| {
                let metrics: Vec<_> = state
                    .activation_expiry_ns
                    .iter()
                    .filter(|(_, expiry)| **expiry > elapsed_ns)
                    .map(|(metric_id, expiry)| ActiveMetricRecord {
                        metric_id: *metric_id,
                        remaining_ttl_ns: expiry - elapsed_ns,
                    })
                    .collect();
                (!metrics.is_empty()).then_some(ActiveConfigRecord { key: *key, metrics })
            })
            .collect();
        ActiveConfigsSnapshot {
            captured_elapsed_ns: elapsed_ns,
            configs,
        }
    }

    fn metadata_snapshot(&self, wall_ns: i64, _elapsed_ns: i64) -> MetadataSnapshot {
        let wall_sec = wall_ns / NS_PER_SEC;
        let configs = self
            .configs
            .iter()
            .filter_map(|(key, state)| {
                let alerts: Vec<_> = state
                    .refractory_ends_wall_sec
                    .iter()
                    .filter(|(_, ends)| **ends > wall_sec)
                    .map(|(alert_id, ends)| AlertMetadataRecord {
                        alert_id: *alert_id,
                        refractory_ends_wall_sec: *ends,
                    })
                    .collect();
                (!alerts.is_empty()).then_some(ConfigMetadataRecord { key: *key, alerts })
            })
            .collect();
        MetadataSnapshot {
            captured_wall_ns: wall_ns,
            configs,
        }
    }

    fn save_active_configs_snapshot(&mut self, elapsed_ns: i64) -> Result<(), EngineError> {
        let snapshot = self.active_configs_snapshot(elapsed_ns);
        self.store.write_active_configs(&snapshot)?;
        Ok(())
    }

    fn save_metadata_snapshot(&mut self, wall_ns: i64, elapsed_ns: i64) -> Result<(), EngineError> {
        let snapshot = self.metadata_snapshot(wall_ns, elapsed_ns);
        self.store.write_metadata(&snapshot)?;
        Ok(())
    }

    fn load_active_configs_snapshot(&mut self, elapsed_ns: i64) -> Result<(), EngineError> {
        if let Some(snapshot) = self.store.take_active_configs()? {
            self.restore_active_configs_state(&snapshot, elapsed_ns);
        }
        Ok(())
    }

    fn load_metadata_snapshot(&mut self, wall_ns: i64, elapsed_ns: i64) -> Result<(), EngineError> {
        if let Some(snapshot) = self.store.take_metadata()? {
            self.restore_metadata_state(&snapshot, wall_ns, elapsed_ns);
        }
        Ok(())
    }

    fn enforce_retention(&mut self, wall_ns: i64, _elapsed_ns: i64) -> Result<(), EngineError> {
        for (key, state) in &self.configs {
            let Some(ttl_secs) = state.definition.ttl_secs else {
                continue;
            };
            let cutoff = wall_ns.saturating_sub((ttl_secs as i64).saturating_mul(NS_PER_SEC));
            let evicted = self.store.purge_reports_before(*key, cutoff)?;
            if evicted > 0 {
                debug!(%key, evicted, "evicted expired reports");
            }
        }
        Ok(())
    }

    fn reset_all_state(&mut self) {
        for state in self.configs.values_mut() {
            state.reset();
        }
    }

    fn restore_active_configs_state(
        &mut self,
        snapshot: &ActiveConfigsSnapshot,
        elapsed_ns: i64,
    ) {
        for record in &snapshot.configs {
            let Some(state) = self.configs.get_mut(&record.key) else {
                debug!(key = %record.key, "skipping activation state of unknown config");
                continue;
            };
            for metric in record.metrics.iter().filter(|m| m.remaining_ttl_ns > 0) {
                state
                    .activation_expiry_ns
                    .insert(metric.metric_id, elapsed_ns.saturating_add(metric.remaining_ttl_ns));
            }
        }
    }

    fn restore_metadata_state(
        &mut self,
        snapshot: &MetadataSnapshot,
        wall_ns: i64,
        _elapsed_ns: i64,
    ) {
        let wall_sec = wall_ns / NS_PER_SEC;
        for record in &snapshot.configs {
            let Some(state) = self.configs.get_mut(&record.key) else {
                continue;
            };
            for alert in record
                .alerts
                .iter()
                .filter(|alert| alert.refractory_ends_wall_sec > wall_sec)
            {
                state
                    .refractory_ends_wall_sec
                    .insert(alert.alert_id, alert.refractory_ends_wall_sec);
            }
        }
    }

    fn dump_report(
        &mut self,
        key: ConfigKey,
        request: ReportRequest,
    ) -> Result<Vec<u8>, EngineError> {
        let state = self
            .configs
            .get_mut(&key)
            .ok_or(EngineError::UnknownConfig(key))?;
        let mut reports = if request.erase_data {
            self.store.take_reports(key)?
        } else {
            self.store.read_reports(key)?
        };
        if request.include_current_bucket && !state.bucket.is_empty() {
            let current = if request.erase_data {
                Self::take_bucket(state, key, request.reason, request.wall_ns, request.elapsed_ns)
            } else {
                StoredReport {
                    key,
                    reason: request.reason,
                    bucket_start_ns: state.bucket_start_ns,
                    bucket_end_ns: request.elapsed_ns,
                    wall_ns: request.wall_ns,
                    counts: state.bucket.clone(),
                }
            };
            reports.push(current);
        }
        Ok(serde_json::to_vec(&reports)?)
    }

    fn active_configs_for_uid(&self, uid: u32, elapsed_ns: i64) -> Vec<i64> {
        self.configs
            .iter()
            .filter(|(key, state)| key.uid() == uid && state.is_active(elapsed_ns))
            .map(|(key, _)| key.id())
            .collect()
    }
}
