//! Save/reset/restore sequences that keep aggregation state intact across
//! companion restarts, device shutdown and daemon termination.

use serde::Serialize;
use std::sync::{Arc, MutexGuard, PoisonError};
use tracing::{info, warn};

use crate::alarm::AlarmMonitor;
use crate::clock::{Clock, NS_PER_SEC};
use crate::companion::CompanionSlot;
use crate::engine::{
    ActiveConfigsSnapshot, AggregationEngine, DumpLatency, DumpReason, EngineError,
    MetadataSnapshot, SharedEngine,
};
use crate::external::PullerManager;
use crate::readiness::ReadinessGate;
use crate::stats::DaemonStats;

/// Engine state captured by one recovery sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoverySnapshot {
    pub reason: DumpReason,
    pub elapsed_ns: i64,
    pub wall_ns: i64,
    pub active_configs: ActiveConfigsSnapshot,
    pub metadata: MetadataSnapshot,
}

/// Everything a companion death has to detach the companion from.
pub struct CompanionHolders {
    pub slot: Arc<CompanionSlot>,
    pub anomaly_alarms: Arc<AlarmMonitor>,
    pub periodic_alarms: Arc<AlarmMonitor>,
    pub pullers: Arc<dyn PullerManager>,
}

pub struct RecoveryCoordinator {
    engine: SharedEngine,
    clock: Arc<dyn Clock>,
    holders: CompanionHolders,
    gate: Arc<ReadinessGate>,
    stats: Arc<DaemonStats>,
}

impl RecoveryCoordinator {
    pub fn new(
        engine: SharedEngine,
        clock: Arc<dyn Clock>,
        holders: CompanionHolders,
        gate: Arc<ReadinessGate>,
        stats: Arc<DaemonStats>,
    ) -> Self {
        Self {
            engine,
            clock,
            holders,
            gate,
            stats,
        }
    }

    /// Flushes, captures, resets and restores the engine, then forgets the dead
    /// companion everywhere it was held.
    pub fn on_companion_died(&self) -> RecoverySnapshot {
        let elapsed_ns = self.clock.elapsed_ns();
        let wall_ns = self.clock.wall_ns();
        warn!(elapsed_ns, "companion died; preserving aggregation state");
        self.stats.note_companion_death(wall_ns / NS_PER_SEC);
        self.gate.request_termination();

        let snapshot = {
            let mut engine = self.lock_engine();
            self.flush(&mut *engine, DumpReason::CompanionDied, elapsed_ns, wall_ns);
            let snapshot = capture(&*engine, DumpReason::CompanionDied, elapsed_ns, wall_ns);
            engine.reset_all_state();
            engine.restore_active_configs_state(&snapshot.active_configs, elapsed_ns);
            engine.restore_metadata_state(&snapshot.metadata, wall_ns, elapsed_ns);
            snapshot
        };

        self.holders.anomaly_alarms.set_companion(None);
        self.holders.periodic_alarms.set_companion(None);
        self.holders.pullers.set_companion(None);
        self.holders.slot.clear();
        info!(
            active_configs = snapshot.active_configs.configs.len(),
            "aggregation state restored after companion death"
        );
        snapshot
    }

    pub fn on_device_shutdown(&self) -> RecoverySnapshot {
        info!("device shutting down; persisting aggregation state");
        self.persist(DumpReason::DeviceShutdown)
    }

    pub fn on_terminate(&self) -> RecoverySnapshot {
        info!("termination requested; persisting aggregation state");
        self.persist(DumpReason::TerminationSignalReceived)
    }

    /// Applies state persisted by the previous run and evicts expired data.
    pub fn startup(&self) {
        let elapsed_ns = self.clock.elapsed_ns();
        let wall_ns = self.clock.wall_ns();
        let mut engine = self.lock_engine();
        let loaded = engine.load_active_configs_snapshot(elapsed_ns);
        self.note_failure("load active configs", loaded);
        let loaded = engine.load_metadata_snapshot(wall_ns, elapsed_ns);
        self.note_failure("load metadata", loaded);
        let enforced = engine.enforce_retention(wall_ns, elapsed_ns);
        self.note_failure("enforce retention", enforced);
        info!("persisted aggregation state loaded");
    }

    fn persist(&self, reason: DumpReason) -> RecoverySnapshot {
        let elapsed_ns = self.clock.elapsed_ns();
        let wall_ns = self.clock.wall_ns();
        self.gate.request_termination();

        let mut engine = self.lock_engine();
        self.flush(&mut *engine, reason, elapsed_ns, wall_ns);
        let snapshot = capture(&*engine, reason, elapsed_ns, wall_ns);
        let saved = engine.save_active_configs_snapshot(elapsed_ns);
        self.note_failure("save active configs", saved);
        let saved = engine.save_metadata_snapshot(wall_ns, elapsed_ns);
        self.note_failure("save metadata", saved);
        snapshot
    }

    fn flush(
        &self,
        engine: &mut dyn AggregationEngine,
        reason: DumpReason,
        elapsed_ns: i64,
        wall_ns: i64,
    ) {
        let flushed = engine.flush_to_disk(reason, DumpLatency::Fast, elapsed_ns, wall_ns);
        self.note_failure("flush buckets", flushed);
    }

    fn note_failure(&self, step: &'static str, outcome: Result<(), EngineError>) {
        if let Err(err) = outcome {
            self.stats.note_storage_failure();
            warn!(step, error = %err, "recovery step failed; continuing");
        }
    }

    fn lock_engine(&self) -> MutexGuard<'_, dyn AggregationEngine + 'static> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn capture(
    engine: &dyn AggregationEngine,
    reason: DumpReason,
    elapsed_ns: i64,
    wall_ns: i64,
) -> RecoverySnapshot {
    RecoverySnapshot {
        reason,
        elapsed_ns,
        wall_ns,
        active_configs: engine.active_configs_snapshot(elapsed_ns),
        metadata: engine.metadata_snapshot(wall_ns, elapsed_ns),
    }
}
