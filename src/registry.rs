//! Worker registry — group operations over live worker handles.
//!
//! The registry is an explicit instance: create one at startup and pass it
//! (usually as `Arc<WorkerRegistry>`) to whoever needs it.

use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{StopAllError, WorkerError};
use crate::worker::{EventHandler, EventNames, SubscriptionId, WorkerHandle, WorkerId};

/// A handler subscription made through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub worker: WorkerId,
    pub event: String,
    pub id: SubscriptionId,
}

/// Outcome of a multicast: who was sent to and who failed.
#[derive(Debug, Default)]
pub struct Delivery {
    pub sent: Vec<WorkerId>,
    pub failed: Vec<(WorkerId, WorkerError)>,
}

impl Delivery {
    /// True when every targeted worker accepted the message.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Default)]
struct Index {
    /// Ids in first-registration order.
    order: Vec<WorkerId>,
    workers: HashMap<WorkerId, WorkerHandle>,
}

/// Indexed collection of active worker handles.
///
/// Iteration follows first-registration order. Every registered handle is
/// assumed active; unregister a handle when you stop it.
pub struct WorkerRegistry {
    index: RwLock<Index>,
}

impl WorkerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            index: RwLock::new(Index::default()),
        }
    }

    /// Create a new registry ready to be shared.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register handles by id. Re-registering an id replaces the entry in place.
    pub fn register<I>(&self, handles: I)
    where
        I: IntoIterator,
        I::Item: Borrow<WorkerHandle>,
    {
        let mut index = self.index.write();
        for handle in handles {
            let handle = handle.borrow();
            let id = handle.id();
            if index.workers.insert(id, handle.clone()).is_none() {
                index.order.push(id);
                debug!(worker_id = %id, label = ?handle.label(), "Registered worker");
            } else {
                debug!(worker_id = %id, "Re-registered worker");
            }
        }
    }

    /// Remove handles by id. Absent ids are skipped.
    pub fn unregister<I>(&self, handles: I)
    where
        I: IntoIterator,
        I::Item: Into<WorkerId>,
    {
        let ids: HashSet<WorkerId> = handles.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            return;
        }
        let mut index = self.index.write();
        for id in &ids {
            if index.workers.remove(id).is_some() {
                debug!(worker_id = %id, "Unregistered worker");
            }
        }
        index.order.retain(|id| !ids.contains(id));
    }

    pub fn contains(&self, handle: &WorkerHandle) -> bool {
        self.contains_id(handle.id())
    }

    pub fn contains_id(&self, id: WorkerId) -> bool {
        self.index.read().workers.contains_key(&id)
    }

    /// Look up a handle by id.
    pub fn get(&self, id: WorkerId) -> Option<WorkerHandle> {
        self.index.read().workers.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.index.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().order.is_empty()
    }

    /// Registered ids in iteration order.
    pub fn ids(&self) -> Vec<WorkerId> {
        self.index.read().order.clone()
    }

    /// Snapshot of the registered handles in iteration order.
    pub fn handles(&self) -> Vec<WorkerHandle> {
        let index = self.index.read();
        index
            .order
            .iter()
            .filter_map(|id| index.workers.get(id).cloned())
            .collect()
    }

    /// Snapshot minus the excluded ids.
    fn handles_except(&self, excluded: &HashSet<WorkerId>) -> Vec<WorkerHandle> {
        let index = self.index.read();
        index
            .order
            .iter()
            .filter(|id| !excluded.contains(*id))
            .filter_map(|id| index.workers.get(id).cloned())
            .collect()
    }

    /// Apply `f` to every registered handle.
    ///
    /// Runs over a snapshot taken when the call starts: handles registered or
    /// unregistered by `f` (or by anyone else) during the pass do not change
    /// which handles this pass visits.
    pub fn each<F>(&self, mut f: F)
    where
        F: FnMut(&WorkerHandle),
    {
        for handle in self.handles() {
            f(&handle);
        }
    }

    /// Stop and unregister every handle.
    ///
    /// Every handle is attempted even when some fail to stop; failures are
    /// reported together once the pass is complete. Returns how many handles
    /// were removed.
    pub fn stop_all(&self) -> Result<usize, StopAllError> {
        let handles = self.handles();
        let mut failures = Vec::new();

        for handle in &handles {
            if let Err(e) = handle.stop() {
                warn!(worker_id = %handle.id(), error = %e, "Failed to stop worker");
                failures.push((handle.id(), e));
            }
            self.unregister([handle]);
        }

        info!(
            stopped = handles.len() - failures.len(),
            failed = failures.len(),
            "Stopped all workers"
        );

        if failures.is_empty() {
            Ok(handles.len())
        } else {
            Err(StopAllError { failures })
        }
    }

    // ── Listening ───────────────────────────────────────────────────────

    /// Subscribe `handler` to `events` on every currently registered handle.
    ///
    /// Handles registered later are not subscribed.
    pub fn listen<F>(&self, events: impl Into<EventNames>, handler: F) -> Vec<Subscription>
    where
        F: Fn(&WorkerHandle, &Value) + Send + Sync + 'static,
    {
        self.subscribe(self.handles(), events.into(), Arc::new(handler))
    }

    /// Like `listen`, skipping the excluded handles.
    pub fn listen_except<I, F>(
        &self,
        events: impl Into<EventNames>,
        excluded: I,
        handler: F,
    ) -> Vec<Subscription>
    where
        I: IntoIterator,
        I::Item: Into<WorkerId>,
        F: Fn(&WorkerHandle, &Value) + Send + Sync + 'static,
    {
        let excluded = collect_ids(excluded);
        self.subscribe(self.handles_except(&excluded), events.into(), Arc::new(handler))
    }

    fn subscribe(
        &self,
        handles: Vec<WorkerHandle>,
        events: EventNames,
        handler: EventHandler,
    ) -> Vec<Subscription> {
        let mut subscriptions = Vec::with_capacity(handles.len() * events.len());
        for handle in &handles {
            for event in events.iter() {
                let id = handle.on_shared(event, Arc::clone(&handler));
                subscriptions.push(Subscription {
                    worker: handle.id(),
                    event: event.to_string(),
                    id,
                });
            }
        }
        debug!(
            workers = handles.len(),
            subscriptions = subscriptions.len(),
            "Registered listeners"
        );
        subscriptions
    }

    /// Remove subscriptions made by `listen`/`listen_except`.
    ///
    /// Subscriptions on handles no longer registered are skipped. Returns
    /// how many were removed.
    pub fn unlisten(&self, subscriptions: &[Subscription]) -> usize {
        subscriptions
            .iter()
            .filter(|sub| {
                self.get(sub.worker)
                    .is_some_and(|handle| handle.off(&sub.event, sub.id))
            })
            .count()
    }

    // ── Messaging ───────────────────────────────────────────────────────

    /// Send to every registered handle not in `excluded`.
    ///
    /// With non-empty `data` each handle gets the tagged event `event`; with
    /// empty data (absent, `null`, `""` or `[]`) each handle gets `event` as a
    /// plain text message instead. Use `multicast_tagged` to always send a
    /// tagged event.
    pub fn multicast<I>(&self, excluded: I, event: &str, data: Option<Value>) -> Delivery
    where
        I: IntoIterator,
        I::Item: Into<WorkerId>,
    {
        match data.filter(|d| !is_empty_data(d)) {
            Some(data) => self.deliver(excluded, |h| h.send_events(event, data.clone())),
            None => self.deliver(excluded, |h| h.send_text(event)),
        }
    }

    /// Send the tagged event `event` with `data` to every handle not excluded,
    /// whatever `data` holds.
    pub fn multicast_tagged<I>(&self, excluded: I, event: &str, data: Value) -> Delivery
    where
        I: IntoIterator,
        I::Item: Into<WorkerId>,
    {
        self.deliver(excluded, |h| h.send_events(event, data.clone()))
    }

    /// `multicast` to everyone.
    pub fn broadcast(&self, event: &str, data: Option<Value>) -> Delivery {
        self.multicast(std::iter::empty::<WorkerId>(), event, data)
    }

    /// `multicast_tagged` to everyone.
    pub fn broadcast_tagged(&self, event: &str, data: Value) -> Delivery {
        self.multicast_tagged(std::iter::empty::<WorkerId>(), event, data)
    }

    fn deliver<I, F>(&self, excluded: I, send: F) -> Delivery
    where
        I: IntoIterator,
        I::Item: Into<WorkerId>,
        F: Fn(&WorkerHandle) -> Result<(), WorkerError>,
    {
        let excluded = collect_ids(excluded);
        let mut delivery = Delivery::default();

        for handle in self.handles_except(&excluded) {
            match send(&handle) {
                Ok(()) => delivery.sent.push(handle.id()),
                Err(e) => {
                    warn!(worker_id = %handle.id(), error = %e, "Failed to deliver to worker");
                    delivery.failed.push((handle.id(), e));
                }
            }
        }

        debug!(
            sent = delivery.sent.len(),
            failed = delivery.failed.len(),
            excluded = excluded.len(),
            "Multicast delivered"
        );
        delivery
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.ids())
            .finish()
    }
}

fn collect_ids<I>(items: I) -> HashSet<WorkerId>
where
    I: IntoIterator,
    I::Item: Into<WorkerId>,
{
    items.into_iter().map(Into::into).collect()
}

/// Data that switches multicast to plain text mode.
fn is_empty_data(data: &Value) -> bool {
    match data {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}
