use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub const NS_PER_SEC: i64 = 1_000_000_000;

/// Time source pairing the elapsed-since-boot clock with wall-clock time.
///
/// Snapshots and retention are keyed on both readings, so every consumer takes
/// them from the same source.
pub trait Clock: Send + Sync {
    /// Nanoseconds on the monotonic elapsed clock.
    fn elapsed_ns(&self) -> i64;

    /// Nanoseconds since the Unix epoch.
    fn wall_ns(&self) -> i64;

    /// Whole seconds on the elapsed clock (alarm deadlines are second-granular).
    fn elapsed_sec(&self) -> u64 {
        (self.elapsed_ns() / NS_PER_SEC).max(0) as u64
    }

    /// Whole seconds on the wall clock.
    fn wall_sec(&self) -> i64 {
        self.wall_ns() / NS_PER_SEC
    }
}

/// Process clock backed by `Instant` and `SystemTime`.
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn elapsed_ns(&self) -> i64 {
        self.start.elapsed().as_nanos().min(i64::MAX as u128) as i64
    }

    fn wall_ns(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock shared between a test and the code under test.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    elapsed: Arc<AtomicI64>,
    wall: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(elapsed_ns: i64, wall_ns: i64) -> Self {
        Self {
            elapsed: Arc::new(AtomicI64::new(elapsed_ns)),
            wall: Arc::new(AtomicI64::new(wall_ns)),
        }
    }

    /// Moves both clocks forward by `delta_ns`.
    pub fn advance_ns(&self, delta_ns: i64) {
        self.elapsed.fetch_add(delta_ns, Ordering::SeqCst);
        self.wall.fetch_add(delta_ns, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance_ns(secs.saturating_mul(NS_PER_SEC));
    }

    pub fn set_elapsed_ns(&self, elapsed_ns: i64) {
        self.elapsed.store(elapsed_ns, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn elapsed_ns(&self) -> i64 {
        self.elapsed.load(Ordering::SeqCst)
    }

    fn wall_ns(&self) -> i64 {
        self.wall.load(Ordering::SeqCst)
    }
}
