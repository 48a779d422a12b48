//! The daemon's externally reachable surface.
//!
//! Every operation runs its access check before touching any state. The
//! service owns the pump, the readiness gate, both alarm monitors and the
//! recovery coordinator, and wires the companion's death notification into
//! the recovery sequence.

use serde::Serialize;
use std::collections::BTreeSet;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::access::{
    AccessError, AccessGate, BuildMode, CallerIdentity, GrantTable, PermissionOracle,
    AID_SYSTEM, PERMISSION_DUMP, PERMISSION_REGISTER_PULL_ATOM, TRACED_PROBES_CONTEXT,
};
use crate::alarm::{AlarmKind, AlarmMonitor};
use crate::clock::{Clock, SystemClock, NS_PER_SEC};
use crate::companion::{CompanionSlot, DeathRecipient, StatsCompanion};
use crate::config::DaemonConfig;
use crate::engine::{
    AggregationEngine, ConfigDefinition, ConfigKey, DumpLatency, DumpReason, EngineError,
    InMemoryEngine, ReportRequest, SharedEngine,
};
use crate::event::Event;
use crate::external::{
    ConfigStore, MemoryConfigStore, MemoryPullerManager, MemoryUidMap, PackageInfo,
    PullAtomCallback, PullAtomMetadata, PullerManager, UidMap,
};
use crate::pump::{EngineSink, EventIngestionPump, LiveSinkSlot, SinkSet};
use crate::queue::{EventQueue, QueueError};
use crate::readiness::{ReadinessCondition, ReadinessGate};
use crate::recovery::{CompanionHolders, RecoveryCoordinator, RecoverySnapshot};
use crate::stats::{DaemonStats, StatsSnapshot};
use crate::storage::SnapshotStore;
use crate::subscription::{SubscriptionCallback, SubscriptionConfig, SubscriptionId};

/// What callers of the service see.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Security(#[from] AccessError),
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("{0} callback is null")]
    NullCallback(&'static str),
    #[error("stats companion unavailable despite it contacting the daemon")]
    CompanionUnavailable,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("failed to start worker thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Collaborators the service drives but does not own.
pub struct Collaborators {
    pub engine: SharedEngine,
    pub config_store: Arc<dyn ConfigStore>,
    pub uid_map: Arc<dyn UidMap>,
    pub pullers: Arc<dyn PullerManager>,
    pub permissions: Arc<dyn PermissionOracle>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// In-memory collaborators around an [`InMemoryEngine`] persisting to `store`.
    pub fn in_memory(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            engine: crate::engine::share(InMemoryEngine::new(store)),
            config_store: Arc::new(MemoryConfigStore::new()),
            uid_map: Arc::new(MemoryUidMap::new()),
            pullers: Arc::new(MemoryPullerManager::new()),
            permissions: Arc::new(GrantTable::new()),
            clock: Arc::new(SystemClock::new()),
        }
    }
}

/// Human-readable state served by [`TelemetryService::dump`].
#[derive(Debug, Clone, Serialize)]
pub struct DumpState {
    pub build_mode: BuildMode,
    pub readiness: &'static str,
    pub satisfied_conditions: Vec<&'static str>,
    pub anomaly_alarm_registered_sec: Option<u32>,
    pub periodic_alarm_registered_sec: Option<u32>,
    pub companion_attached: bool,
    pub queued_events: usize,
    pub live_subscriptions: usize,
    pub stats: StatsSnapshot,
}

pub struct TelemetryService {
    clock: Arc<dyn Clock>,
    stats: Arc<DaemonStats>,
    access: AccessGate,
    permissions: Arc<dyn PermissionOracle>,
    engine: SharedEngine,
    config_store: Arc<dyn ConfigStore>,
    uid_map: Arc<dyn UidMap>,
    pullers: Arc<dyn PullerManager>,
    companion: Arc<CompanionSlot>,
    anomaly_alarms: Arc<AlarmMonitor>,
    periodic_alarms: Arc<AlarmMonitor>,
    gate: Arc<ReadinessGate>,
    recovery: Arc<RecoveryCoordinator>,
    live: Arc<LiveSinkSlot>,
    sinks: SinkSet,
    pump: EventIngestionPump,
    lifecycle: Mutex<()>,
}

impl TelemetryService {
    /// Builds every component and starts the event pump.
    pub fn start(
        config: &DaemonConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ServiceError> {
        let Collaborators {
            engine,
            config_store,
            uid_map,
            pullers,
            permissions,
            clock,
        } = collaborators;
        let stats = Arc::new(DaemonStats::new());
        let companion = Arc::new(CompanionSlot::new());
        let anomaly_alarms = Arc::new(AlarmMonitor::new(
            AlarmKind::Anomaly,
            config.min_alarm_diff_secs,
            Arc::clone(&stats),
        ));
        let periodic_alarms = Arc::new(AlarmMonitor::new(
            AlarmKind::Periodic,
            config.min_alarm_diff_secs,
            Arc::clone(&stats),
        ));

        let gate_engine = Arc::clone(&engine);
        let gate_clock = Arc::clone(&clock);
        let gate = Arc::new(ReadinessGate::new(
            ReadinessCondition::ALL,
            config.init_event_delay(),
            Box::new(move || {
                let elapsed_ns = gate_clock.elapsed_ns();
                gate_engine
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .on_boot_completed(elapsed_ns);
            }),
            Arc::clone(&stats),
        ));

        let recovery = Arc::new(RecoveryCoordinator::new(
            Arc::clone(&engine),
            Arc::clone(&clock),
            CompanionHolders {
                slot: Arc::clone(&companion),
                anomaly_alarms: Arc::clone(&anomaly_alarms),
                periodic_alarms: Arc::clone(&periodic_alarms),
                pullers: Arc::clone(&pullers),
            },
            Arc::clone(&gate),
            Arc::clone(&stats),
        ));

        // Configs and snapshots are restored before the pump admits events.
        replay_configs(config_store.as_ref(), &engine, clock.elapsed_ns());
        recovery.startup();

        let live = Arc::new(LiveSinkSlot::new(config.subscription_buffer_capacity));
        let sinks = SinkSet::new(
            Arc::new(EngineSink::new(Arc::clone(&engine))),
            Arc::clone(&live),
            Arc::clone(&stats),
        );
        let queue = Arc::new(EventQueue::new(config.event_queue_capacity, Arc::clone(&stats)));
        let pump = EventIngestionPump::start(queue, sinks.clone())?;

        info!(
            build_mode = %config.build_mode,
            init_delay_secs = config.init_event_delay_secs,
            "telemetry service started"
        );
        Ok(Self {
            clock,
            access: AccessGate::new(config.build_mode, Arc::clone(&stats)),
            stats,
            permissions,
            engine,
            config_store,
            uid_map,
            pullers,
            companion,
            anomaly_alarms,
            periodic_alarms,
            gate,
            recovery,
            live,
            sinks,
            pump,
            lifecycle: Mutex::new(()),
        })
    }

    pub fn stats(&self) -> &Arc<DaemonStats> {
        &self.stats
    }

    pub fn anomaly_alarms(&self) -> &Arc<AlarmMonitor> {
        &self.anomaly_alarms
    }

    pub fn periodic_alarms(&self) -> &Arc<AlarmMonitor> {
        &self.periodic_alarms
    }

    pub fn readiness(&self) -> &Arc<ReadinessGate> {
        &self.gate
    }

    pub fn recovery(&self) -> &Arc<RecoveryCoordinator> {
        &self.recovery
    }

    pub fn companion_attached(&self) -> bool {
        self.companion.is_present()
    }

    /// Producer entry: enqueues `event` for the pump.
    pub fn log_event(&self, event: Event) -> Result<i64, QueueError> {
        self.pump.queue().push(event)
    }

    /// Dispatches `event` synchronously to the same sinks the pump feeds.
    pub fn on_log_event(&self, event: &Event) {
        self.sinks.dispatch(event);
    }

    pub fn system_running(&self, caller: &CallerIdentity) -> Result<(), ServiceError> {
        self.access.check_uid(caller, AID_SYSTEM)?;
        match self.companion.get() {
            Some(companion) => {
                if let Err(err) = companion.statsd_ready() {
                    warn!(error = %err, "failed to notify companion that the daemon is ready");
                }
            }
            None => debug!("companion not attached yet; skipping ready notification"),
        }
        Ok(())
    }

    /// Attaches the companion everywhere it is needed and watches for its death.
    pub fn stats_companion_ready(
        &self,
        caller: &CallerIdentity,
        companion: Option<Arc<dyn StatsCompanion>>,
    ) -> Result<(), ServiceError> {
        self.access.check_uid(caller, AID_SYSTEM)?;
        let companion = companion.ok_or(ServiceError::CompanionUnavailable)?;
        let recovery: Weak<RecoveryCoordinator> = Arc::downgrade(&self.recovery);
        let recipient = DeathRecipient::new(move || {
            if let Some(recovery) = recovery.upgrade() {
                recovery.on_companion_died();
            }
        });
        if let Err(err) = companion.link_to_death(recipient) {
            warn!(error = %err, "failed to watch companion liveness");
        }
        self.companion.set(Arc::clone(&companion));
        self.pullers.set_companion(Some(Arc::clone(&companion)));
        self.anomaly_alarms.set_companion(Some(Arc::clone(&companion)));
        self.periodic_alarms.set_companion(Some(companion));
        info!("stats companion attached");
        Ok(())
    }

    pub fn boot_completed(&self, caller: &CallerIdentity) -> Result<(), ServiceError> {
        self.access.check_uid(caller, AID_SYSTEM)?;
        self.gate.mark_complete(ReadinessCondition::BootComplete);
        Ok(())
    }

    pub fn inform_all_uid_data(
        &self,
        caller: &CallerIdentity,
        packages: Vec<PackageInfo>,
    ) -> Result<(), ServiceError> {
        self.access.check_uid(caller, AID_SYSTEM)?;
        debug!(packages = packages.len(), "received full uid map");
        self.uid_map.update_all(packages);
        self.gate.mark_complete(ReadinessCondition::UidMapReceived);
        Ok(())
    }

    pub fn inform_one_package(
        &self,
        caller: &CallerIdentity,
        package: PackageInfo,
    ) -> Result<(), ServiceError> {
        self.access.check_uid(caller, AID_SYSTEM)?;
        self.uid_map.update_package(package);
        Ok(())
    }

    /// Forgets a package and drops every config its uid owned.
    pub fn inform_one_package_removed(
        &self,
        caller: &CallerIdentity,
        name: &str,
        uid: u32,
    ) -> Result<(), ServiceError> {
        self.access.check_uid(caller, AID_SYSTEM)?;
        self.uid_map.remove_package(name, uid);
        let removed = self.config_store.remove_uid(uid);
        if !removed.is_empty() {
            let mut engine = self.lock_engine();
            for key in &removed {
                engine.on_config_removed(*key);
            }
            info!(uid, configs = removed.len(), "dropped configs of removed package");
        }
        Ok(())
    }

    pub fn all_pullers_from_boot_registered(
        &self,
        caller: &CallerIdentity,
    ) -> Result<(), ServiceError> {
        self.access.check_uid(caller, AID_SYSTEM)?;
        self.gate.mark_complete(ReadinessCondition::PullersRegistered);
        Ok(())
    }

    /// Anomaly alarms are evaluated inline on events; the fired alarm itself
    /// carries no work.
    pub fn inform_anomaly_alarm_fired(&self, caller: &CallerIdentity) -> Result<(), ServiceError> {
        self.access.check_uid(caller, AID_SYSTEM)?;
        debug!("anomaly alarm fired");
        Ok(())
    }

    /// Pops the due periodic alarms and hands them to the engine.
    pub fn inform_alarm_for_subscriber_triggering_fired(
        &self,
        caller: &CallerIdentity,
    ) -> Result<(), ServiceError> {
        self.access.check_uid(caller, AID_SYSTEM)?;
        let now_sec = u32::try_from(self.clock.elapsed_sec()).unwrap_or(u32::MAX);
        let fired = self.periodic_alarms.pop_sooner_than(now_sec);
        if fired.is_empty() {
            warn!(now_sec, "periodic alarm fired but no alarm was due");
            return Ok(());
        }
        self.lock_engine()
            .on_periodic_alarm(i64::from(now_sec) * NS_PER_SEC, &fired);
        Ok(())
    }

    pub fn inform_poll_alarm_fired(&self, caller: &CallerIdentity) -> Result<(), ServiceError> {
        self.access.check_uid(caller, AID_SYSTEM)?;
        let elapsed_ns = self.clock.elapsed_ns();
        self.lock_engine().on_pull_alarm(elapsed_ns);
        Ok(())
    }

    pub fn inform_device_shutdown(
        &self,
        caller: &CallerIdentity,
    ) -> Result<RecoverySnapshot, ServiceError> {
        self.access.check_uid(caller, AID_SYSTEM)?;
        Ok(self.recovery.on_device_shutdown())
    }

    /// Returns and erases every report of config `id` owned by `calling_uid`.
    pub fn get_data(
        &self,
        caller: &CallerIdentity,
        id: i64,
        calling_uid: u32,
    ) -> Result<Vec<u8>, ServiceError> {
        self.access.check_uid(caller, AID_SYSTEM)?;
        let request = ReportRequest {
            elapsed_ns: self.clock.elapsed_ns(),
            wall_ns: self.clock.wall_ns(),
            include_current_bucket: true,
            erase_data: true,
            reason: DumpReason::GetDataCalled,
            latency: DumpLatency::NoTimeConstraints,
        };
        let report = self
            .lock_engine()
            .dump_report(ConfigKey::new(calling_uid, id), request)?;
        Ok(report)
    }

    pub fn get_metadata(&self, caller: &CallerIdentity) -> Result<Vec<u8>, ServiceError> {
        self.access.check_uid(caller, AID_SYSTEM)?;
        self.stats
            .to_json_bytes()
            .map_err(|err| ServiceError::Engine(err.into()))
    }

    pub fn add_configuration(
        &self,
        caller: &CallerIdentity,
        id: i64,
        raw: &[u8],
        calling_uid: u32,
    ) -> Result<(), ServiceError> {
        self.access.check_uid(caller, AID_SYSTEM)?;
        let key = ConfigKey::new(calling_uid, id);
        let definition = ConfigDefinition::parse(raw).map_err(|err| {
            ServiceError::IllegalArgument(format!("config {key} is malformed: {err}"))
        })?;
        self.config_store.put(key, raw.to_vec());
        let elapsed_ns = self.clock.elapsed_ns();
        self.lock_engine().on_config_updated(key, definition, elapsed_ns);
        info!(%key, "configuration updated");
        Ok(())
    }

    pub fn remove_configuration(
        &self,
        caller: &CallerIdentity,
        id: i64,
        calling_uid: u32,
    ) -> Result<(), ServiceError> {
        self.access.check_uid(caller, AID_SYSTEM)?;
        let key = ConfigKey::new(calling_uid, id);
        if self.config_store.remove(key) {
            self.lock_engine().on_config_removed(key);
            info!(%key, "configuration removed");
        }
        Ok(())
    }

    pub fn get_active_configs(
        &self,
        caller: &CallerIdentity,
        calling_uid: u32,
    ) -> Result<Vec<i64>, ServiceError> {
        self.access.check_uid(caller, AID_SYSTEM)?;
        let elapsed_ns = self.clock.elapsed_ns();
        Ok(self.lock_engine().active_configs_for_uid(calling_uid, elapsed_ns))
    }

    pub fn register_pull_atom_callback(
        &self,
        caller: &CallerIdentity,
        uid: u32,
        atom_tag: u32,
        metadata: PullAtomMetadata,
        callback: Option<Arc<dyn PullAtomCallback>>,
    ) -> Result<(), ServiceError> {
        self.access.check_uid(caller, AID_SYSTEM)?;
        let callback = callback.ok_or(ServiceError::NullCallback("pull atom"))?;
        self.pullers
            .register_pull_callback(uid, atom_tag, metadata, callback);
        Ok(())
    }

    pub fn unregister_pull_atom_callback(
        &self,
        caller: &CallerIdentity,
        uid: u32,
        atom_tag: u32,
    ) -> Result<(), ServiceError> {
        self.access.check_uid(caller, AID_SYSTEM)?;
        self.pullers.unregister_pull_callback(uid, atom_tag);
        Ok(())
    }

    /// Registers a pull callback on behalf of the calling uid.
    pub fn register_native_pull_atom_callback(
        &self,
        caller: &CallerIdentity,
        atom_tag: u32,
        metadata: PullAtomMetadata,
        callback: Option<Arc<dyn PullAtomCallback>>,
    ) -> Result<(), ServiceError> {
        self.access.check_permission(
            caller,
            PERMISSION_REGISTER_PULL_ATOM,
            self.permissions.as_ref(),
        )?;
        let callback = callback.ok_or(ServiceError::NullCallback("pull atom"))?;
        self.pullers
            .register_pull_callback(caller.uid, atom_tag, metadata, callback);
        Ok(())
    }

    pub fn unregister_native_pull_atom_callback(
        &self,
        caller: &CallerIdentity,
        atom_tag: u32,
    ) -> Result<(), ServiceError> {
        self.access.check_permission(
            caller,
            PERMISSION_REGISTER_PULL_ATOM,
            self.permissions.as_ref(),
        )?;
        self.pullers.unregister_pull_callback(caller.uid, atom_tag);
        Ok(())
    }

    /// Starts a live subscription, creating the subscription hub on first use.
    pub fn add_subscription(
        &self,
        caller: &CallerIdentity,
        raw_config: &[u8],
        callback: Option<Arc<dyn SubscriptionCallback>>,
    ) -> Result<SubscriptionId, ServiceError> {
        self.access.check_context(caller, TRACED_PROBES_CONTEXT)?;
        let callback = callback.ok_or(ServiceError::NullCallback("subscription"))?;
        let config = SubscriptionConfig::parse(raw_config)
            .map_err(|err| ServiceError::IllegalArgument(err.to_string()))?;
        self.live
            .get_or_init()
            .subscribe(config, callback)
            .map_err(|err| ServiceError::IllegalArgument(err.to_string()))
    }

    pub fn remove_subscription(
        &self,
        caller: &CallerIdentity,
        id: SubscriptionId,
    ) -> Result<bool, ServiceError> {
        self.access.check_context(caller, TRACED_PROBES_CONTEXT)?;
        Ok(self.live.get().is_some_and(|hub| hub.unsubscribe(id)))
    }

    pub fn flush_subscription(
        &self,
        caller: &CallerIdentity,
        id: SubscriptionId,
    ) -> Result<bool, ServiceError> {
        self.access.check_context(caller, TRACED_PROBES_CONTEXT)?;
        Ok(self.live.get().is_some_and(|hub| hub.flush(id)))
    }

    /// JSON rendering of the daemon's coordination state.
    pub fn dump(&self, caller: &CallerIdentity) -> Result<Vec<u8>, ServiceError> {
        self.access
            .check_permission(caller, PERMISSION_DUMP, self.permissions.as_ref())?;
        let state = DumpState {
            build_mode: self.access.build_mode(),
            readiness: self.gate.state().as_str(),
            satisfied_conditions: self
                .gate
                .satisfied()
                .into_iter()
                .map(ReadinessCondition::as_str)
                .collect(),
            anomaly_alarm_registered_sec: self.anomaly_alarms.registered_deadline(),
            periodic_alarm_registered_sec: self.periodic_alarms.registered_deadline(),
            companion_attached: self.companion.is_present(),
            queued_events: self.pump.queue().len(),
            live_subscriptions: self.live.get().map_or(0, |hub| hub.len()),
            stats: self.stats.snapshot(),
        };
        serde_json::to_vec(&state).map_err(|err| ServiceError::Engine(err.into()))
    }

    /// Resolves the uid a shell command acts on behalf of.
    pub fn resolve_command_uid(
        &self,
        caller: &CallerIdentity,
        raw: &str,
    ) -> Result<u32, ServiceError> {
        self.access.check_shell(caller)?;
        Ok(self.access.resolve_target_uid(caller, raw)?)
    }

    /// Persists state ahead of process exit.
    pub fn terminate(&self) -> RecoverySnapshot {
        let _lifecycle = self.lock_lifecycle();
        self.recovery.on_terminate()
    }

    /// Stops the pump and the readiness worker. Idempotent.
    pub fn shutdown(&self) {
        let _lifecycle = self.lock_lifecycle();
        self.pump.shutdown();
        self.gate.shutdown();
    }

    /// Conditions still missing before the boot-complete barrier fires.
    pub fn pending_conditions(&self) -> BTreeSet<ReadinessCondition> {
        let satisfied = self.gate.satisfied();
        self.gate
            .required()
            .into_iter()
            .filter(|condition| !satisfied.contains(condition))
            .collect()
    }

    fn lock_engine(&self) -> MutexGuard<'_, dyn AggregationEngine + 'static> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TelemetryService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Hands every stored config back to the engine; malformed entries are skipped.
fn replay_configs(store: &dyn ConfigStore, engine: &SharedEngine, elapsed_ns: i64) {
    let mut engine = engine.lock().unwrap_or_else(PoisonError::into_inner);
    for (key, raw) in store.entries() {
        match ConfigDefinition::parse(&raw) {
            Ok(definition) => engine.on_config_updated(key, definition, elapsed_ns),
            Err(err) => {
                warn!(%key, error = %err, "skipping stored config that no longer parses");
            }
        }
    }
}
