//! Single-consumer loop that drains the event queue into the sinks.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread;
use tracing::{error, info};

use crate::engine::SharedEngine;
use crate::event::Event;
use crate::queue::{EventQueue, QueueEntry};
use crate::stats::DaemonStats;
use crate::subscription::SubscriptionHub;

/// Consumer of dispatched events. Sinks do not report errors.
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    fn on_event(&self, event: &Event);
}

/// Primary sink feeding the aggregation engine.
pub struct EngineSink {
    engine: SharedEngine,
}

impl EngineSink {
    pub fn new(engine: SharedEngine) -> Self {
        Self { engine }
    }
}

impl EventSink for EngineSink {
    fn name(&self) -> &str {
        "engine"
    }

    fn on_event(&self, event: &Event) {
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_event(event);
    }
}

/// Lazily created live-subscription sink, shared by the pump and the service.
pub struct LiveSinkSlot {
    buffer_capacity: usize,
    hub: OnceLock<Arc<SubscriptionHub>>,
}

impl LiveSinkSlot {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            buffer_capacity,
            hub: OnceLock::new(),
        }
    }

    pub fn get(&self) -> Option<&Arc<SubscriptionHub>> {
        self.hub.get()
    }

    pub fn get_or_init(&self) -> &Arc<SubscriptionHub> {
        self.hub.get_or_init(|| {
            info!(buffer_capacity = self.buffer_capacity, "initializing subscription hub");
            Arc::new(SubscriptionHub::new(self.buffer_capacity))
        })
    }
}

/// The sinks one event is delivered to, in order.
#[derive(Clone)]
pub struct SinkSet {
    primary: Arc<dyn EventSink>,
    live: Arc<LiveSinkSlot>,
    stats: Arc<DaemonStats>,
}

impl SinkSet {
    pub fn new(
        primary: Arc<dyn EventSink>,
        live: Arc<LiveSinkSlot>,
        stats: Arc<DaemonStats>,
    ) -> Self {
        Self {
            primary,
            live,
            stats,
        }
    }

    /// Delivers `event` to the primary sink, then to the live sink when present.
    pub fn dispatch(&self, event: &Event) {
        self.deliver(self.primary.as_ref(), event);
        if let Some(hub) = self.live.get() {
            self.deliver(hub.as_ref(), event);
        }
        self.stats.note_event_dispatched();
    }

    fn deliver(&self, sink: &dyn EventSink, event: &Event) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| sink.on_event(event)));
        if outcome.is_err() {
            self.stats.note_sink_panic();
            error!(sink = sink.name(), atom_id = event.atom_id(), "event sink panicked");
        }
    }
}

/// Owner of the `event-pump` thread.
pub struct EventIngestionPump {
    queue: Arc<EventQueue>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EventIngestionPump {
    pub fn start(queue: Arc<EventQueue>, sinks: SinkSet) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_queue = Arc::clone(&queue);
        let thread_stop = Arc::clone(&stop);
        let worker = thread::Builder::new()
            .name("event-pump".into())
            .spawn(move || run(&thread_queue, &thread_stop, &sinks))?;
        info!(capacity = queue.capacity(), "event pump started");
        Ok(Self {
            queue,
            stop,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stops the pump after every event queued so far is delivered. Later calls
    /// are no-ops.
    pub fn shutdown(&self) {
        let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        self.queue.push_wakeup();
        if worker.join().is_err() {
            error!("event pump thread panicked");
        }
        info!("event pump stopped");
    }
}

impl Drop for EventIngestionPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(queue: &EventQueue, stop: &AtomicBool, sinks: &SinkSet) {
    loop {
        match queue.wait_entry() {
            QueueEntry::Event(event) => sinks.dispatch(&event),
            QueueEntry::Wakeup => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
            }
        }
    }
}
