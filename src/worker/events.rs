//! Event subscription table owned by each worker handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::Value;

use super::handle::WorkerHandle;

/// Fires for every inbound payload, tagged or not.
pub const MESSAGE_EVENT: &str = "message";

/// Fires when the execution unit reports a runtime fault.
pub const ERROR_EVENT: &str = "error";

/// Subscriber callback: `(handle, data)`.
pub type EventHandler = Arc<dyn Fn(&WorkerHandle, &Value) + Send + Sync>;

/// Identifies one registration within an event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Publish/subscribe table mapping event names to ordered handler lists.
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<(SubscriptionId, EventHandler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe `handler` to `event`. Handlers fire in registration order.
    pub fn on(&self, event: &str, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove one registration. Returns false if it was not present.
    pub fn off(&self, event: &str, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub, _)| *sub != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event);
        }
        removed
    }

    /// Number of handlers currently subscribed to `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.handlers.read().get(event).map_or(0, Vec::len)
    }

    /// Invoke every handler for `event` and return how many ran.
    ///
    /// Handlers are snapshotted first, so a handler may subscribe or
    /// unsubscribe without deadlocking; such changes apply to the next fire.
    pub fn fire(&self, handle: &WorkerHandle, event: &str, data: &Value) -> usize {
        let snapshot: Vec<EventHandler> = match self.handlers.read().get(event) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return 0,
        };
        for handler in &snapshot {
            handler(handle, data);
        }
        snapshot.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        let mut names: Vec<_> = handlers.keys().cloned().collect();
        names.sort();
        f.debug_struct("EventBus").field("events", &names).finish()
    }
}
