use std::sync::{Arc, Mutex};

use telemd::{
    AlarmError, AlarmHandle, AlarmKind, AlarmMonitor, CompanionError, DaemonStats,
    StatsCompanion,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Register(AlarmKind, i64),
    Cancel(AlarmKind),
}

#[derive(Default)]
struct RecordingCompanion {
    calls: Mutex<Vec<Call>>,
}

impl RecordingCompanion {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl StatsCompanion for RecordingCompanion {
    fn statsd_ready(&self) -> Result<(), CompanionError> {
        Ok(())
    }

    fn register_alarm(&self, kind: AlarmKind, deadline_ms: i64) -> Result<(), CompanionError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Register(kind, deadline_ms));
        Ok(())
    }

    fn cancel_alarm(&self, kind: AlarmKind) -> Result<(), CompanionError> {
        self.calls.lock().unwrap().push(Call::Cancel(kind));
        Ok(())
    }
}

fn monitor_with_companion(
    kind: AlarmKind,
) -> (AlarmMonitor, Arc<RecordingCompanion>, Arc<DaemonStats>) {
    let stats = Arc::new(DaemonStats::new());
    let monitor = AlarmMonitor::new(kind, 5, stats.clone());
    let companion = Arc::new(RecordingCompanion::default());
    monitor.set_companion(Some(companion.clone()));
    (monitor, companion, stats)
}

#[test]
fn small_moves_of_the_nearest_deadline_do_not_reregister() {
    let (monitor, companion, _stats) = monitor_with_companion(AlarmKind::Periodic);
    let handle = AlarmHandle::new(1);

    monitor.set(100, handle).unwrap();
    assert_eq!(companion.calls(), vec![Call::Register(AlarmKind::Periodic, 100_000)]);
    companion.clear();

    monitor.set(103, handle).unwrap();
    assert!(companion.calls().is_empty());
    assert_eq!(monitor.registered_deadline(), Some(100));

    monitor.set(110, handle).unwrap();
    assert_eq!(companion.calls(), vec![Call::Register(AlarmKind::Periodic, 110_000)]);
    assert_eq!(monitor.registered_deadline(), Some(110));
}

#[test]
fn an_earlier_alarm_beyond_the_threshold_reregisters() {
    let (monitor, companion, stats) = monitor_with_companion(AlarmKind::Anomaly);
    monitor.set(200, AlarmHandle::new(1)).unwrap();
    monitor.set(198, AlarmHandle::new(2)).unwrap();
    assert_eq!(monitor.registered_deadline(), Some(200));

    monitor.set(150, AlarmHandle::new(3)).unwrap();
    assert_eq!(
        companion.calls(),
        vec![
            Call::Register(AlarmKind::Anomaly, 200_000),
            Call::Register(AlarmKind::Anomaly, 150_000),
        ]
    );
    assert_eq!(stats.registered_alarm_changes(AlarmKind::Anomaly), 2);
    assert_eq!(stats.registered_alarm_changes(AlarmKind::Periodic), 0);
}

#[test]
fn pop_returns_exactly_the_due_subset() {
    let (monitor, companion, _stats) = monitor_with_companion(AlarmKind::Periodic);
    monitor.set(10, AlarmHandle::new(1)).unwrap();
    monitor.set(20, AlarmHandle::new(2)).unwrap();
    monitor.set(30, AlarmHandle::new(3)).unwrap();
    monitor.set(40, AlarmHandle::new(4)).unwrap();
    companion.clear();

    let due = monitor.pop_sooner_than(20);
    assert_eq!(due, vec![AlarmHandle::new(1), AlarmHandle::new(2)]);
    assert_eq!(monitor.len(), 2);
    assert_eq!(monitor.nearest_deadline(), Some(30));
    assert_eq!(companion.calls(), vec![Call::Register(AlarmKind::Periodic, 30_000)]);

    assert!(monitor.pop_sooner_than(25).is_empty());
    assert_eq!(companion.calls().len(), 1);
}

#[test]
fn popping_everything_cancels_the_registration() {
    let (monitor, companion, _stats) = monitor_with_companion(AlarmKind::Periodic);
    monitor.set(10, AlarmHandle::new(1)).unwrap();
    companion.clear();

    assert_eq!(monitor.pop_sooner_than(60), vec![AlarmHandle::new(1)]);
    assert_eq!(companion.calls(), vec![Call::Cancel(AlarmKind::Periodic)]);
    assert_eq!(monitor.registered_deadline(), None);
    assert!(monitor.is_empty());
}

#[test]
fn cancelling_the_last_alarm_cancels_the_registration() {
    let (monitor, companion, _stats) = monitor_with_companion(AlarmKind::Anomaly);
    monitor.set(50, AlarmHandle::new(7)).unwrap();
    monitor.set(52, AlarmHandle::new(8)).unwrap();
    companion.clear();

    assert!(monitor.cancel(AlarmHandle::new(7)));
    assert!(companion.calls().is_empty());
    assert!(monitor.cancel(AlarmHandle::new(8)));
    assert_eq!(companion.calls(), vec![Call::Cancel(AlarmKind::Anomaly)]);
    assert!(!monitor.cancel(AlarmHandle::new(8)));
}

#[test]
fn zero_deadline_is_rejected() {
    let (monitor, companion, _stats) = monitor_with_companion(AlarmKind::Anomaly);
    assert_eq!(
        monitor.set(0, AlarmHandle::new(1)),
        Err(AlarmError::InvalidDeadline(0))
    );
    assert!(monitor.is_empty());
    assert!(companion.calls().is_empty());
}

#[test]
fn detached_monitor_keeps_entries_and_reattaching_registers_nearest() {
    let stats = Arc::new(DaemonStats::new());
    let monitor = AlarmMonitor::new(AlarmKind::Periodic, 5, stats);
    monitor.set(300, AlarmHandle::new(1)).unwrap();
    monitor.set(120, AlarmHandle::new(2)).unwrap();
    assert!(!monitor.has_companion());
    assert_eq!(monitor.len(), 2);

    let companion = Arc::new(RecordingCompanion::default());
    monitor.set_companion(Some(companion.clone()));
    assert_eq!(companion.calls(), vec![Call::Register(AlarmKind::Periodic, 120_000)]);

    monitor.set_companion(None);
    monitor.set(60, AlarmHandle::new(3)).unwrap();
    assert_eq!(companion.calls().len(), 1);
    assert_eq!(monitor.registered_deadline(), Some(60));
}

#[test]
fn monitors_are_independent() {
    let stats = Arc::new(DaemonStats::new());
    let anomaly = AlarmMonitor::new(AlarmKind::Anomaly, 5, stats.clone());
    let periodic = AlarmMonitor::new(AlarmKind::Periodic, 5, stats.clone());
    let companion = Arc::new(RecordingCompanion::default());
    anomaly.set_companion(Some(companion.clone()));
    periodic.set_companion(Some(companion.clone()));

    anomaly.set(10, AlarmHandle::new(1)).unwrap();
    periodic.set(500, AlarmHandle::new(1)).unwrap();
    assert_eq!(anomaly.pop_sooner_than(100), vec![AlarmHandle::new(1)]);

    assert_eq!(periodic.len(), 1);
    assert_eq!(periodic.registered_deadline(), Some(500));
    assert_eq!(
        companion.calls(),
        vec![
            Call::Register(AlarmKind::Anomaly, 10_000),
            Call::Register(AlarmKind::Periodic, 500_000),
            Call::Cancel(AlarmKind::Anomaly),
        ]
    );
}
