// src/event/manager.rs
// Event pipeline plumbing: the bounded in-memory queue, the background
// spooler that drains it to the console's bulk endpoint, and the
// EventManager facade that producers talk to.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::errors::{AgentError, Result};
use crate::event::base::{Event, EventSpec};
use crate::management::ManagementConnection;

pub const MAX_SPOOLED_EVENTS: usize = 10_000;
pub const BULK_SIZE: usize = 100;
const QUEUE_POLL_PERIOD: Duration = Duration::from_secs(1);

/// In-memory FIFO of events awaiting shipment. Cloning shares the queue.
#[derive(Clone, Default)]
pub struct EventQueue {
    inner: Arc<Mutex<VecDeque<Event>>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, event: Event) {
        self.inner.lock().expect("event queue poisoned").push_back(event);
    }

    pub fn get(&self) -> Option<Event> {
        self.inner.lock().expect("event queue poisoned").pop_front()
    }

    /// Removes and returns up to `max` events, preserving order.
    pub fn drain(&self, max: usize) -> Vec<Event> {
        let mut queue = self.inner.lock().expect("event queue poisoned");
        let count = max.min(queue.len());
        queue.drain(..count).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("event queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Background worker that drains the event queue in bulks and POSTs them to
/// the console. Send failures are logged and the batch is dropped; durable
/// queueing is a future extension.
pub struct EventSpooler {
    conn: ManagementConnection,
    queue: EventQueue,
    running: Arc<AtomicBool>,
    stop: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl EventSpooler {
    pub fn new(conn: ManagementConnection, queue: EventQueue) -> Self {
        EventSpooler {
            conn,
            queue,
            running: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(Notify::new()),
            handle: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let conn = self.conn.clone();
        let queue = self.queue.clone();
        let running = self.running.clone();
        let stop = self.stop.clone();
        running.store(true, Ordering::SeqCst);

        self.handle = Some(tokio::spawn(async move {
            info!("EventSpooler started");
            loop {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let batch = queue.drain(BULK_SIZE);
                if batch.is_empty() {
                    tokio::select! {
                        _ = stop.notified() => break,
                        _ = tokio::time::sleep(QUEUE_POLL_PERIOD) => {}
                    }
                    continue;
                }
                if conn.bulk_events(&batch).await {
                    info!("Sent {} events to {}", batch.len(), conn.url());
                } else {
                    warn!(
                        "Failed to send {} events to {}; batch dropped",
                        batch.len(),
                        conn.url()
                    );
                }
            }
            running.store(false, Ordering::SeqCst);
            info!("EventSpooler stopped");
        }));
    }

    /// Signals the worker to exit at the next loop boundary. Unless called
    /// from inside the worker, waits for it to finish.
    pub async fn stop(&mut self, from_self: bool) {
        self.running.store(false, Ordering::SeqCst);
        self.stop.notify_one();
        if !from_self {
            if let Some(handle) = self.handle.take() {
                let _ = handle.await;
            }
        }
    }
}

/// A raw record or an already-prepared event handed to `prepare_events`.
pub enum EventPayload {
    Prepared(Event),
    Raw(Value),
}

impl From<Event> for EventPayload {
    fn from(event: Event) -> Self {
        EventPayload::Prepared(event)
    }
}

impl From<Value> for EventPayload {
    fn from(value: Value) -> Self {
        EventPayload::Raw(value)
    }
}

struct EventManagerState {
    queue: EventQueue,
    initialized: AtomicBool,
    back_pressure: AtomicU64,
    max_spooled_events: usize,
    spooler: tokio::sync::Mutex<Option<EventSpooler>>,
}

/// Facade between event producers and the queue. Must be initialized with a
/// console connection (which starts the spooler) before events are accepted.
#[derive(Clone)]
pub struct EventManager {
    state: Arc<EventManagerState>,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    pub fn new() -> Self {
        Self::with_max_spooled(MAX_SPOOLED_EVENTS)
    }

    pub fn with_max_spooled(max_spooled_events: usize) -> Self {
        EventManager {
            state: Arc::new(EventManagerState {
                queue: EventQueue::new(),
                initialized: AtomicBool::new(false),
                back_pressure: AtomicU64::new(1),
                max_spooled_events,
                spooler: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.initialized.load(Ordering::SeqCst)
    }

    pub fn queue(&self) -> &EventQueue {
        &self.state.queue
    }

    pub fn back_pressure(&self) -> u64 {
        self.state.back_pressure.load(Ordering::SeqCst)
    }

    /// Binds the manager to a console connection and starts the spooler.
    /// A second initialization is an error.
    pub async fn initialize(&self, conn: ManagementConnection) -> Result<()> {
        self.initialize_with(conn, true).await
    }

    /// Initialization with control over whether the spooler starts; used by
    /// the supervisor during tests and offline runs.
    pub async fn initialize_with(
        &self,
        conn: ManagementConnection,
        start_spooler: bool,
    ) -> Result<()> {
        if self.state.initialized.swap(true, Ordering::SeqCst) {
            return Err(AgentError::EventManagerInitialized);
        }
        if start_spooler {
            let mut spooler = EventSpooler::new(conn, self.state.queue.clone());
            spooler.start();
            *self.state.spooler.lock().await = Some(spooler);
            info!("EventManager initialized");
        }
        Ok(())
    }

    /// Stops the spooler, waiting for any in-flight batch.
    pub async fn shutdown(&self) {
        if let Some(mut spooler) = self.state.spooler.lock().await.take() {
            spooler.stop(false).await;
        }
    }

    /// Prepares events for shipment: already-formed events are enqueued as
    /// is, raw records are converted through the extraction spec. Stalls the
    /// producer while the queue is over its bound.
    pub async fn prepare_events(
        &self,
        events: Vec<EventPayload>,
        spec: &EventSpec,
    ) -> Result<usize> {
        if !self.is_initialized() {
            return Err(AgentError::EventManagerNotInitialized);
        }

        // Backpressure: stall with a growing delay until the spooler has
        // drained the queue below the bound.
        while self.state.queue.len() > self.state.max_spooled_events {
            let delay = self.state.back_pressure.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(
                "Event queue is full ({} events). Holding events until the queue drains",
                self.state.queue.len()
            );
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
        self.state.back_pressure.store(1, Ordering::SeqCst);

        let mut effective = spec.clone();
        if effective.source.is_none() {
            effective.source = Some("Unknown".to_string());
        }

        let mut count = 0;
        for payload in events {
            match payload {
                EventPayload::Prepared(event) => {
                    self.state.queue.put(event);
                    count += 1;
                }
                EventPayload::Raw(record) => {
                    let event = Event::from_record(&record, &effective)?;
                    self.state.queue.put(event);
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}
