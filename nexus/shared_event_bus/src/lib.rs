#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! In-process publish/subscribe for module-to-module coordination.
//!
//! Delivery is synchronous on the emitting thread. Handlers must be fast and
//! non-blocking; a panicking handler never propagates to the emitter. The bus
//! retains a bounded ring of recent events for observability endpoints.

use std::{
    collections::{HashMap, VecDeque},
    fs::{self, File, OpenOptions},
    io::Write,
    panic::{catch_unwind, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Number of recent events retained for inspection.
pub const RECENT_EVENTS_CAP: usize = 200;

/// Subscriber receiving all event types.
pub const WILDCARD: &str = "*";

/// One emitted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    /// Event type, dotted lowercase (e.g. `action.completed`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub data: Value,
}

/// Synchronous event handler.
pub type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Token identifying one subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
}

/// Thread-safe in-process event bus with a bounded recent-events ring.
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<Subscription>>>,
    recent: Mutex<VecDeque<BusEvent>>,
    next_id: Mutex<u64>,
    sink: Option<Mutex<File>>,
    sink_path: Option<PathBuf>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("sink_path", &self.sink_path)
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus without a durable sink.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_EVENTS_CAP)),
            next_id: Mutex::new(0),
            sink: None,
            sink_path: None,
        }
    }

    /// Creates a bus that additionally appends every event to a JSONL file.
    pub fn with_sink(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut bus = Self::new();
        bus.sink = Some(Mutex::new(file));
        bus.sink_path = Some(path);
        Ok(bus)
    }

    /// Registers a handler for `event_type` (or [`WILDCARD`] for all).
    pub fn subscribe(&self, event_type: impl Into<String>, handler: Handler) -> SubscriptionId {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            SubscriptionId(*next)
        };
        self.subscribers
            .lock()
            .entry(event_type.into())
            .or_default()
            .push(Subscription { id, handler });
        id
    }

    /// Removes a previously registered handler. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        for subs in subscribers.values_mut() {
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                subs.remove(pos);
                return true;
            }
        }
        false
    }

    /// Emits an event to all matching subscribers.
    ///
    /// The subscriber list is snapshotted under the lock; handlers run after
    /// the lock is released. Handler panics are swallowed.
    pub fn emit(&self, event_type: impl Into<String>, data: Value) {
        let event = BusEvent {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            data,
        };

        {
            let mut recent = self.recent.lock();
            if recent.len() >= RECENT_EVENTS_CAP {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        if let Some(sink) = &self.sink {
            let mut file = sink.lock();
            if serde_json::to_writer(&mut *file, &event).is_ok() {
                let _ = file.write_all(b"\n");
                let _ = file.flush();
            }
        }

        let handlers: Vec<Handler> = {
            let subscribers = self.subscribers.lock();
            let mut snapshot = Vec::new();
            if let Some(subs) = subscribers.get(&event.event_type) {
                snapshot.extend(subs.iter().map(|s| Arc::clone(&s.handler)));
            }
            if let Some(subs) = subscribers.get(WILDCARD) {
                snapshot.extend(subs.iter().map(|s| Arc::clone(&s.handler)));
            }
            snapshot
        };

        for handler in handlers {
            let _ = catch_unwind(AssertUnwindSafe(|| handler(&event)));
        }
    }

    /// Returns the most recent events in emission order, optionally filtered
    /// by type, at most `limit` entries.
    #[must_use]
    pub fn recent_events(&self, limit: usize, filter_type: Option<&str>) -> Vec<BusEvent> {
        let recent = self.recent.lock();
        let filtered: Vec<BusEvent> = recent
            .iter()
            .filter(|event| filter_type.map_or(true, |t| event.event_type == t))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    /// Clears subscribers and retained events (intended for tests).
    pub fn clear(&self) {
        self.subscribers.lock().clear();
        self.recent.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[test]
    fn delivers_to_typed_and_wildcard_subscribers() {
        let bus = EventBus::new();
        let typed = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));
        let typed_clone = Arc::clone(&typed);
        let all_clone = Arc::clone(&all);
        bus.subscribe(
            "action.completed",
            Arc::new(move |_| {
                typed_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bus.subscribe(
            WILDCARD,
            Arc::new(move |_| {
                all_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bus.emit("action.completed", json!({"ok": true}));
        bus.emit("knowledge.learned", json!({}));
        assert_eq!(typed.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handler_panic_is_swallowed() {
        let bus = EventBus::new();
        bus.subscribe("boom", Arc::new(|_| panic!("handler failure")));
        bus.emit("boom", Value::Null);
        assert_eq!(bus.recent_events(10, None).len(), 1);
    }

    #[test]
    fn ring_preserves_order_and_cap() {
        let bus = EventBus::new();
        for i in 0..(RECENT_EVENTS_CAP + 25) {
            bus.emit("tick", json!({ "i": i }));
        }
        let events = bus.recent_events(RECENT_EVENTS_CAP + 25, None);
        assert_eq!(events.len(), RECENT_EVENTS_CAP);
        assert_eq!(events.first().unwrap().data["i"], 25);
        assert_eq!(events.last().unwrap().data["i"], RECENT_EVENTS_CAP + 24);
    }

    #[test]
    fn filter_and_limit_apply_to_recent_events() {
        let bus = EventBus::new();
        bus.emit("a", json!({"n": 1}));
        bus.emit("b", json!({"n": 2}));
        bus.emit("a", json!({"n": 3}));
        let events = bus.recent_events(1, Some("a"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["n"], 3);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let id = bus.subscribe(
            "x",
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bus.emit("x", Value::Null);
        assert!(bus.unsubscribe(id));
        bus.emit("x", Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sink_persists_events_as_jsonl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let bus = EventBus::with_sink(&path).unwrap();
        bus.emit("action.completed", json!({"ok": true}));
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("action.completed"));
    }
}
