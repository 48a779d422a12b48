use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::stats::DaemonStats;

/// Delay between the barrier completing and the completion callback running.
pub const DEFAULT_INIT_EVENT_DELAY: Duration = Duration::from_secs(90);

/// Named precondition of the boot-complete barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReadinessCondition {
    BootComplete,
    UidMapReceived,
    PullersRegistered,
}

impl ReadinessCondition {
    pub const ALL: [ReadinessCondition; 3] = [
        ReadinessCondition::BootComplete,
        ReadinessCondition::UidMapReceived,
        ReadinessCondition::PullersRegistered,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReadinessCondition::BootComplete => "boot_complete",
            ReadinessCondition::UidMapReceived => "uid_map_received",
            ReadinessCondition::PullersRegistered => "pullers_registered",
        }
    }
}

impl fmt::Display for ReadinessCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the gate. `Fired` and `Cancelled` are terminal and exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Waiting,
    Armed,
    Fired,
    Cancelled,
}

impl GateState {
    pub fn as_str(self) -> &'static str {
        match self {
            GateState::Waiting => "waiting",
            GateState::Armed => "armed",
            GateState::Fired => "fired",
            GateState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, GateState::Fired | GateState::Cancelled)
    }
}

/// Work run once the barrier fires.
pub type ReadinessCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
struct GateInner {
    required: BTreeSet<ReadinessCondition>,
    satisfied: BTreeSet<ReadinessCondition>,
    state: GateState,
    termination_requested: bool,
}

#[derive(Debug)]
struct GateShared {
    inner: Mutex<GateInner>,
    cv: Condvar,
}

impl GateShared {
    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One-shot barrier over a fixed set of [`ReadinessCondition`]s.
///
/// Completing the last required condition arms the gate and hands the
/// callback to a dedicated `readiness-gate` worker, which waits out the
/// configured delay before running it. [`request_termination`] interrupts
/// that wait and cancels the callback.
///
/// [`request_termination`]: ReadinessGate::request_termination
pub struct ReadinessGate {
    shared: Arc<GateShared>,
    delay: Duration,
    callback: Mutex<Option<ReadinessCallback>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    stats: Arc<DaemonStats>,
}

impl ReadinessGate {
    pub fn new(
        required: impl IntoIterator<Item = ReadinessCondition>,
        delay: Duration,
        callback: ReadinessCallback,
        stats: Arc<DaemonStats>,
    ) -> Self {
        Self {
            shared: Arc::new(GateShared {
                inner: Mutex::new(GateInner {
                    required: required.into_iter().collect(),
                    satisfied: BTreeSet::new(),
                    state: GateState::Waiting,
                    termination_requested: false,
                }),
                cv: Condvar::new(),
            }),
            delay,
            callback: Mutex::new(Some(callback)),
            worker: Mutex::new(None),
            stats,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Records `condition`. Returns `true` when this call completed the barrier.
    pub fn mark_complete(&self, condition: ReadinessCondition) -> bool {
        {
            let mut inner = self.shared.lock();
            if !inner.required.contains(&condition) {
                warn!(%condition, "ignoring readiness condition outside the required set");
                return false;
            }
            if inner.state != GateState::Waiting {
                debug!(%condition, state = ?inner.state, "readiness gate already settled");
                return false;
            }
            if !inner.satisfied.insert(condition) {
                return false;
            }
            debug!(
                %condition,
                satisfied = inner.satisfied.len(),
                required = inner.required.len(),
                "readiness condition satisfied"
            );
            if inner.satisfied != inner.required {
                return false;
            }
            inner.state = GateState::Armed;
        }
        info!(delay_ms = self.delay.as_millis() as u64, "readiness gate armed");
        self.spawn_worker();
        true
    }

    /// Interrupts a pending delay. A gate that has not fired yet never will.
    pub fn request_termination(&self) {
        let mut inner = self.shared.lock();
        inner.termination_requested = true;
        if inner.state == GateState::Waiting {
            inner.state = GateState::Cancelled;
            self.stats.note_readiness_cancelled();
            debug!("readiness gate cancelled before arming");
        }
        self.shared.cv.notify_all();
    }

    pub fn state(&self) -> GateState {
        self.shared.lock().state
    }

    pub fn satisfied(&self) -> BTreeSet<ReadinessCondition> {
        self.shared.lock().satisfied.clone()
    }

    pub fn required(&self) -> BTreeSet<ReadinessCondition> {
        self.shared.lock().required.clone()
    }

    /// Requests termination and waits for the worker, if one was started.
    pub fn shutdown(&self) {
        self.request_termination();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("readiness gate worker panicked");
            }
        }
    }

    fn spawn_worker(&self) {
        let Some(callback) = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        let stats = Arc::clone(&self.stats);
        let delay = self.delay;
        let spawned = thread::Builder::new()
            .name("readiness-gate".into())
            .spawn(move || run_worker(shared, delay, callback, stats));
        match spawned {
            Ok(handle) => {
                *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            Err(err) => {
                error!(error = %err, "failed to spawn readiness gate worker");
                let mut inner = self.shared.lock();
                inner.state = GateState::Cancelled;
                self.stats.note_readiness_cancelled();
            }
        }
    }
}

impl Drop for ReadinessGate {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    shared: Arc<GateShared>,
    delay: Duration,
    callback: ReadinessCallback,
    stats: Arc<DaemonStats>,
) {
    let guard = shared.lock();
    let (mut guard, _) = shared
        .cv
        .wait_timeout_while(guard, delay, |inner| !inner.termination_requested)
        .unwrap_or_else(PoisonError::into_inner);
    if guard.termination_requested {
        guard.state = GateState::Cancelled;
        drop(guard);
        stats.note_readiness_cancelled();
        info!("termination requested; skipping readiness callback");
        return;
    }
    guard.state = GateState::Fired;
    drop(guard);
    stats.note_readiness_fired();
    info!("readiness gate fired");
    callback();
}
