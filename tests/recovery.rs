use std::sync::{Arc, Mutex};
use std::time::Duration;

use telemd::{
    ActivationRule, ActiveConfigsSnapshot, AggregationEngine, AlarmHandle, AlarmKind,
    AlarmMonitor, AlertRule, Clock, CompanionError, CompanionHolders, CompanionSlot,
    ConfigDefinition, ConfigKey, DaemonStats, DumpReason, Event, GateState, InMemoryEngine,
    ManualClock, MemoryPullerManager, MemorySnapshotStore, MetadataSnapshot, PullerManager,
    ReadinessCondition, ReadinessGate, RecoveryCoordinator, SharedEngine, SnapshotStore,
    StatsCompanion, StorageError, StoredReport, NS_PER_SEC,
};

const KEY: ConfigKey = ConfigKey::new(1000, 42);
const WALL_START_NS: i64 = 1_700_000_000 * NS_PER_SEC;

struct NoopCompanion;

impl StatsCompanion for NoopCompanion {
    fn statsd_ready(&self) -> Result<(), CompanionError> {
        Ok(())
    }

    fn register_alarm(&self, _kind: AlarmKind, _deadline_ms: i64) -> Result<(), CompanionError> {
        Ok(())
    }

    fn cancel_alarm(&self, _kind: AlarmKind) -> Result<(), CompanionError> {
        Ok(())
    }
}

/// Store whose every write fails.
#[derive(Default)]
struct BrokenStore;

impl BrokenStore {
    fn failure() -> StorageError {
        StorageError::Io {
            path: "/broken".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        }
    }
}

impl SnapshotStore for BrokenStore {
    fn write_active_configs(&self, _: &ActiveConfigsSnapshot) -> Result<(), StorageError> {
        Err(Self::failure())
    }

    fn take_active_configs(&self) -> Result<Option<ActiveConfigsSnapshot>, StorageError> {
        Err(Self::failure())
    }

    fn write_metadata(&self, _: &MetadataSnapshot) -> Result<(), StorageError> {
        Err(Self::failure())
    }

    fn take_metadata(&self) -> Result<Option<MetadataSnapshot>, StorageError> {
        Ok(None)
    }

    fn write_report(&self, _: &StoredReport) -> Result<(), StorageError> {
        Err(Self::failure())
    }

    fn read_reports(&self, _: ConfigKey) -> Result<Vec<StoredReport>, StorageError> {
        Ok(Vec::new())
    }

    fn take_reports(&self, _: ConfigKey) -> Result<Vec<StoredReport>, StorageError> {
        Ok(Vec::new())
    }

    fn remove_reports(&self, _: ConfigKey) -> Result<(), StorageError> {
        Ok(())
    }

    fn purge_reports_before(&self, _: ConfigKey, _: i64) -> Result<usize, StorageError> {
        Ok(0)
    }

    fn purge_all(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

struct Fixture {
    engine: Arc<Mutex<InMemoryEngine>>,
    clock: ManualClock,
    stats: Arc<DaemonStats>,
    slot: Arc<CompanionSlot>,
    anomaly: Arc<AlarmMonitor>,
    periodic: Arc<AlarmMonitor>,
    pullers: Arc<MemoryPullerManager>,
    gate: Arc<ReadinessGate>,
    coordinator: RecoveryCoordinator,
}

fn fixture(store: Arc<dyn SnapshotStore>) -> Fixture {
    let engine = Arc::new(Mutex::new(InMemoryEngine::new(store)));
    let shared: SharedEngine = engine.clone();
    let clock = ManualClock::new(10 * NS_PER_SEC, WALL_START_NS);
    let stats = Arc::new(DaemonStats::new());
    let slot = Arc::new(CompanionSlot::new());
    let anomaly = Arc::new(AlarmMonitor::new(AlarmKind::Anomaly, 5, stats.clone()));
    let periodic = Arc::new(AlarmMonitor::new(AlarmKind::Periodic, 5, stats.clone()));
    let pullers = Arc::new(MemoryPullerManager::new());
    let gate = Arc::new(ReadinessGate::new(
        ReadinessCondition::ALL,
        Duration::from_secs(90),
        Box::new(|| {}),
        stats.clone(),
    ));
    let coordinator = RecoveryCoordinator::new(
        shared,
        Arc::new(clock.clone()),
        CompanionHolders {
            slot: slot.clone(),
            anomaly_alarms: anomaly.clone(),
            periodic_alarms: periodic.clone(),
            pullers: pullers.clone(),
        },
        gate.clone(),
        stats.clone(),
    );
    Fixture {
        engine,
        clock,
        stats,
        slot,
        anomaly,
        periodic,
        pullers,
        gate,
        coordinator,
    }
}

fn definition() -> ConfigDefinition {
    ConfigDefinition {
        atom_ids: [10].into_iter().collect(),
        activations: vec![ActivationRule {
            metric_id: 7,
            activation_atom: 50,
            ttl_secs: 600,
        }],
        alerts: vec![AlertRule {
            alert_id: 3,
            atom_id: 10,
            threshold: 1,
            refractory_secs: 300,
        }],
        ttl_secs: None,
    }
}

/// Activates the config and trips its alert, leaving two counted events in
/// the open bucket.
fn populate(fx: &Fixture) {
    let elapsed = fx.clock.elapsed_ns();
    let wall = WALL_START_NS;
    let mut engine = fx.engine.lock().unwrap();
    engine.on_config_updated(KEY, definition(), elapsed);
    engine.on_event(&Event::new(50, elapsed).with_wall_ns(wall));
    engine.on_event(&Event::new(10, elapsed + 1).with_wall_ns(wall));
    engine.on_event(&Event::new(10, elapsed + 2).with_wall_ns(wall));
}

fn attach_companion(fx: &Fixture) {
    let companion: Arc<dyn StatsCompanion> = Arc::new(NoopCompanion);
    fx.slot.set(companion.clone());
    fx.anomaly.set_companion(Some(companion.clone()));
    fx.periodic.set_companion(Some(companion.clone()));
    fx.pullers.set_companion(Some(companion));
}

#[test]
fn companion_death_flushes_resets_and_restores() {
    let store = Arc::new(MemorySnapshotStore::new());
    let fx = fixture(store.clone());
    populate(&fx);
    attach_companion(&fx);
    fx.periodic.set(5_000, AlarmHandle::new(1)).unwrap();
    fx.clock.advance_secs(5);

    let (active_before, metadata_before) = {
        let engine = fx.engine.lock().unwrap();
        let elapsed = fx.clock.elapsed_ns();
        let wall = fx.clock.wall_ns();
        (
            engine.active_configs_snapshot(elapsed),
            engine.metadata_snapshot(wall, elapsed),
        )
    };
    assert_eq!(active_before.configs.len(), 1);
    assert_eq!(metadata_before.configs.len(), 1);

    let snapshot = fx.coordinator.on_companion_died();

    assert_eq!(snapshot.reason, DumpReason::CompanionDied);
    assert_eq!(snapshot.active_configs, active_before);
    assert_eq!(snapshot.metadata, metadata_before);

    let reports = store.read_reports(KEY).unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].reason, DumpReason::CompanionDied);
    assert_eq!(reports[0].counts.get(&10), Some(&2));

    {
        let engine = fx.engine.lock().unwrap();
        assert_eq!(engine.bucket_count(KEY, 10), 0);
        assert_eq!(
            engine.active_configs_snapshot(snapshot.elapsed_ns),
            snapshot.active_configs
        );
        assert_eq!(
            engine.metadata_snapshot(snapshot.wall_ns, snapshot.elapsed_ns),
            snapshot.metadata
        );
    }

    assert!(!fx.slot.is_present());
    assert!(!fx.anomaly.has_companion());
    assert!(!fx.periodic.has_companion());
    assert!(!fx.pullers.has_companion());
    assert_eq!(fx.periodic.len(), 1);
    assert_eq!(fx.gate.state(), GateState::Cancelled);
    assert_eq!(fx.stats.companion_deaths(), vec![WALL_START_NS / NS_PER_SEC + 5]);
    assert!(store.peek_active_configs().is_none());
}

#[test]
fn device_shutdown_persists_snapshots_that_startup_restores() {
    let store = Arc::new(MemorySnapshotStore::new());
    let fx = fixture(store.clone());
    populate(&fx);

    let snapshot = fx.coordinator.on_device_shutdown();
    assert_eq!(snapshot.reason, DumpReason::DeviceShutdown);
    assert_eq!(store.peek_active_configs(), Some(snapshot.active_configs.clone()));
    assert_eq!(store.peek_metadata(), Some(snapshot.metadata.clone()));
    assert_eq!(store.read_reports(KEY).unwrap().len(), 1);

    let restarted = fixture(store.clone());
    restarted
        .engine
        .lock()
        .unwrap()
        .on_config_updated(KEY, definition(), 0);
    restarted.coordinator.startup();

    let engine = restarted.engine.lock().unwrap();
    let elapsed = restarted.clock.elapsed_ns();
    assert_eq!(engine.active_configs_snapshot(elapsed), snapshot.active_configs);
    assert_eq!(
        engine.metadata_snapshot(WALL_START_NS, elapsed),
        snapshot.metadata
    );
    assert_eq!(engine.active_configs_for_uid(KEY.uid(), elapsed), vec![KEY.id()]);
    assert!(store.peek_active_configs().is_none());
}

#[test]
fn termination_cancels_a_pending_readiness_callback() {
    let store = Arc::new(MemorySnapshotStore::new());
    let fx = fixture(store.clone());
    for condition in ReadinessCondition::ALL {
        fx.gate.mark_complete(condition);
    }
    assert_eq!(fx.gate.state(), GateState::Armed);

    let snapshot = fx.coordinator.on_terminate();
    assert_eq!(snapshot.reason, DumpReason::TerminationSignalReceived);
    fx.gate.shutdown();
    assert_eq!(fx.gate.state(), GateState::Cancelled);
    assert!(store.peek_active_configs().is_some());
}

#[test]
fn storage_failures_do_not_abort_the_sequence() {
    let fx = fixture(Arc::new(BrokenStore));
    populate(&fx);
    attach_companion(&fx);

    let snapshot = fx.coordinator.on_device_shutdown();
    assert_eq!(snapshot.active_configs.configs.len(), 1);
    assert_eq!(fx.stats.snapshot().storage_failures, 3);

    fx.coordinator.on_companion_died();
    assert!(!fx.slot.is_present());
    fx.coordinator.startup();
    assert_eq!(fx.stats.snapshot().storage_failures, 4);
}

#[test]
fn restore_of_a_snapshot_reproduces_the_state() {
    let fx = fixture(Arc::new(MemorySnapshotStore::new()));
    populate(&fx);
    let elapsed = fx.clock.elapsed_ns();

    let mut engine = fx.engine.lock().unwrap();
    let active = engine.active_configs_snapshot(elapsed);
    let metadata = engine.metadata_snapshot(WALL_START_NS, elapsed);
    engine.reset_all_state();
    assert!(engine.active_configs_snapshot(elapsed).configs.is_empty());
    assert!(engine.metadata_snapshot(WALL_START_NS, elapsed).configs.is_empty());

    engine.restore_active_configs_state(&active, elapsed);
    engine.restore_metadata_state(&metadata, WALL_START_NS, elapsed);
    assert_eq!(engine.active_configs_snapshot(elapsed), active);
    assert_eq!(engine.metadata_snapshot(WALL_START_NS, elapsed), metadata);
}
