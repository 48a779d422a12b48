use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use telemd::{DaemonStats, GateState, ReadinessCondition, ReadinessGate};

fn wait_for<F>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not met within {:?}", timeout);
}

fn counting_gate(delay: Duration) -> (Arc<ReadinessGate>, Arc<AtomicUsize>, Arc<DaemonStats>) {
    let fired = Arc::new(AtomicUsize::new(0));
    let stats = Arc::new(DaemonStats::new());
    let counter = fired.clone();
    let gate = ReadinessGate::new(
        ReadinessCondition::ALL,
        delay,
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        stats.clone(),
    );
    (Arc::new(gate), fired, stats)
}

#[test]
fn fires_once_after_the_last_condition() {
    let (gate, fired, stats) = counting_gate(Duration::ZERO);

    assert!(!gate.mark_complete(ReadinessCondition::UidMapReceived));
    assert!(!gate.mark_complete(ReadinessCondition::PullersRegistered));
    assert_eq!(gate.state(), GateState::Waiting);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    assert!(gate.mark_complete(ReadinessCondition::BootComplete));
    // The state flips before the callback runs, so wait on the callback itself.
    wait_for(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 1);
    assert_eq!(gate.state(), GateState::Fired);
    assert_eq!(stats.snapshot().readiness_fired, 1);

    assert!(!gate.mark_complete(ReadinessCondition::BootComplete));
    gate.shutdown();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(gate.state(), GateState::Fired);
}

#[test]
fn concurrent_and_duplicate_marks_fire_exactly_once() {
    let (gate, fired, _stats) = counting_gate(Duration::ZERO);
    let workers: Vec<_> = (0..8)
        .map(|i| {
            let gate = gate.clone();
            thread::spawn(move || {
                let mut completed = 0;
                for step in 0..3 {
                    let condition = ReadinessCondition::ALL[(i + step) % 3];
                    if gate.mark_complete(condition) {
                        completed += 1;
                    }
                }
                completed
            })
        })
        .collect();
    let completions: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();

    assert_eq!(completions, 1);
    wait_for(Duration::from_secs(2), || gate.state() == GateState::Fired);
    gate.shutdown();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn termination_during_the_delay_skips_the_callback() {
    let (gate, fired, stats) = counting_gate(Duration::from_secs(60));
    for condition in ReadinessCondition::ALL {
        gate.mark_complete(condition);
    }
    assert_eq!(gate.state(), GateState::Armed);

    let started = Instant::now();
    gate.request_termination();
    wait_for(Duration::from_secs(2), || gate.state() == GateState::Cancelled);
    gate.shutdown();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(stats.snapshot().readiness_cancelled, 1);
}

#[test]
fn termination_before_arming_prevents_firing() {
    let (gate, fired, _stats) = counting_gate(Duration::ZERO);
    gate.mark_complete(ReadinessCondition::BootComplete);
    gate.request_termination();
    assert_eq!(gate.state(), GateState::Cancelled);

    assert!(!gate.mark_complete(ReadinessCondition::UidMapReceived));
    assert!(!gate.mark_complete(ReadinessCondition::PullersRegistered));
    gate.shutdown();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn conditions_outside_the_required_set_are_ignored() {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let gate = ReadinessGate::new(
        [ReadinessCondition::BootComplete],
        Duration::ZERO,
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        Arc::new(DaemonStats::new()),
    );

    assert!(!gate.mark_complete(ReadinessCondition::UidMapReceived));
    assert!(gate.satisfied().is_empty());
    assert_eq!(gate.state(), GateState::Waiting);

    assert!(gate.mark_complete(ReadinessCondition::BootComplete));
    wait_for(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 1);
    assert!(gate.satisfied().is_subset(&gate.required()));
}

#[test]
fn callback_runs_on_the_gate_worker_thread() {
    let name = Arc::new(std::sync::Mutex::new(None));
    let observed = name.clone();
    let gate = ReadinessGate::new(
        [ReadinessCondition::PullersRegistered],
        Duration::from_millis(10),
        Box::new(move || {
            *observed.lock().unwrap() = thread::current().name().map(str::to_string);
        }),
        Arc::new(DaemonStats::new()),
    );
    gate.mark_complete(ReadinessCondition::PullersRegistered);
    wait_for(Duration::from_secs(2), || gate.state() == GateState::Fired);
    gate.shutdown();
    assert_eq!(name.lock().unwrap().as_deref(), Some("readiness-gate"));
}
