//! Telemetry event bus.
//!
//! Events are loosely-typed JSON maps stamped with a monotonically
//! increasing `_id` and a wall-clock `_ts`. Emission only enqueues; a
//! dedicated consumer thread fans each event out to every registered sink
//! in registration order. A sink that fails is evicted from the bus and a
//! `pool.sinkfailed` event is published in its place.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::util::clock::now_secs_f64;

/// A single telemetry event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event name, dotted by convention (`pool.enqueued`).
    pub name: String,
    /// Monotonically increasing sequence number, unique per bus.
    #[serde(rename = "_id")]
    pub id: u64,
    /// Wall-clock emission time in seconds since the Unix epoch.
    #[serde(rename = "_ts")]
    pub ts: f64,
    /// Free-form payload.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Event {
    /// Payload field lookup.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Consumer of bus events. Returning an error evicts the sink.
pub trait Sink: Send + Sync {
    /// Handle one event.
    fn consume(&self, event: &Event) -> anyhow::Result<()>;

    /// Human-readable identity used in `pool.sinkfailed` payloads.
    fn describe(&self) -> String {
        "<sink>".to_string()
    }
}

/// Adapter turning a closure into a [`Sink`].
pub struct FnSink {
    label: String,
    func: Box<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>,
}

impl FnSink {
    /// Wrap `func` as a sink identified by `label`.
    pub fn new<F>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            func: Box::new(func),
        }
    }
}

impl Sink for FnSink {
    fn consume(&self, event: &Event) -> anyhow::Result<()> {
        (self.func)(event)
    }

    fn describe(&self) -> String {
        format!("<FnSink {}>", self.label)
    }
}

enum BusMessage {
    Event(Event),
    Shutdown,
}

struct BusShared {
    /// The bus lock: ids are stamped and enqueued under it so consumption
    /// order matches id order.
    seq: Mutex<u64>,
    tx: Sender<BusMessage>,
    sinks: Mutex<Vec<Arc<dyn Sink>>>,
}

/// Single-consumer fan-out bus for telemetry events.
pub struct EventBus {
    shared: Arc<BusShared>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Create a bus and start its consumer thread.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        let shared = Arc::new(BusShared {
            seq: Mutex::new(0),
            tx,
            sinks: Mutex::new(Vec::new()),
        });
        let consumer = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("bulkhead-events".to_string())
                .spawn(move || consume_loop(&shared, &rx))
                .expect("failed to spawn event bus consumer")
        };
        Self {
            shared,
            consumer: Mutex::new(Some(consumer)),
        }
    }

    /// Stamp and enqueue an event. Never blocks on sink execution.
    ///
    /// `fields` should be a JSON object (`serde_json::json!({..})`); any
    /// other value is ignored and the event goes out without a payload.
    pub fn emit(&self, name: &str, fields: Value) {
        emit_on(&self.shared, name, fields);
    }

    /// Register a sink. Idempotent: a sink already present (by identity)
    /// is not added twice. Returns whether the sink was added.
    pub fn add_sink(&self, sink: Arc<dyn Sink>) -> bool {
        let mut sinks = self.shared.sinks.lock();
        if sinks.iter().any(|s| Arc::ptr_eq(s, &sink)) {
            return false;
        }
        sinks.push(sink);
        true
    }

    /// Remove a sink by identity. Returns whether it was present.
    pub fn remove_sink(&self, sink: &Arc<dyn Sink>) -> bool {
        let mut sinks = self.shared.sinks.lock();
        let before = sinks.len();
        sinks.retain(|s| !Arc::ptr_eq(s, sink));
        sinks.len() != before
    }

    /// Drop every registered sink.
    pub fn clear_sinks(&self) {
        self.shared.sinks.lock().clear();
    }

    /// Number of active sinks.
    pub fn sink_count(&self) -> usize {
        self.shared.sinks.lock().len()
    }

    /// Enqueue the shutdown sentinel and wait for the consumer to drain
    /// everything emitted before this call.
    pub fn shutdown(&self) {
        let _ = self.shared.tx.send(BusMessage::Shutdown);
        if let Some(handle) = self.consumer.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        // Unblock the consumer if the bus is dropped without shutdown().
        let _ = self.shared.tx.send(BusMessage::Shutdown);
    }
}

fn emit_on(shared: &BusShared, name: &str, fields: Value) {
    let fields = match fields {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            debug!(event = name, payload = %other, "non-object event payload ignored");
            Map::new()
        }
    };
    let mut seq = shared.seq.lock();
    let event = Event {
        name: name.to_string(),
        id: *seq,
        ts: now_secs_f64(),
        fields,
    };
    *seq += 1;
    let _ = shared.tx.send(BusMessage::Event(event));
}

fn consume_loop(shared: &BusShared, rx: &Receiver<BusMessage>) {
    while let Ok(message) = rx.recv() {
        let event = match message {
            BusMessage::Event(event) => event,
            BusMessage::Shutdown => break,
        };
        let sinks: Vec<Arc<dyn Sink>> = shared.sinks.lock().clone();
        for sink in sinks {
            let outcome = catch_unwind(AssertUnwindSafe(|| sink.consume(&event)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => evict_sink(shared, &sink, &format!("{error:#}")),
                Err(_) => evict_sink(shared, &sink, "sink panicked"),
            }
        }
    }
}

fn evict_sink(shared: &BusShared, sink: &Arc<dyn Sink>, error: &str) {
    let removed = {
        let mut sinks = shared.sinks.lock();
        let before = sinks.len();
        sinks.retain(|s| !Arc::ptr_eq(s, sink));
        sinks.len() != before
    };
    if removed {
        warn!(sink = %sink.describe(), error, "event sink failed, removing it");
        emit_on(
            shared,
            "pool.sinkfailed",
            json!({ "sink": sink.describe(), "error": error }),
        );
    }
}

static ROOT: OnceLock<EventBus> = OnceLock::new();

/// The process-wide bus, started lazily on first use.
pub fn root() -> &'static EventBus {
    ROOT.get_or_init(EventBus::new)
}

/// Emit an event on the root bus.
pub fn emit(name: &str, fields: Value) {
    root().emit(name, fields);
}

/// Register a function as a sink on the root bus. Returns the sink handle
/// so it can be removed or re-added later.
pub fn sink<F>(func: F) -> Arc<dyn Sink>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let sink: Arc<dyn Sink> = Arc::new(FnSink::new("fn", func));
    root().add_sink(Arc::clone(&sink));
    sink
}
