//! Worker handle — owning wrapper around one execution unit.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{ConstructionError, WorkerError};

use super::events::{ERROR_EVENT, EventBus, EventHandler, MESSAGE_EVENT, SubscriptionId};
use super::host::{ExecutionUnit, Inbound, ProcessHost, WorkerHost};
use super::message::{EventNames, WorkerMessage};
use super::source::{WorkerOptions, WorkerSource};

/// Globally unique worker identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&WorkerId> for WorkerId {
    fn from(id: &WorkerId) -> Self {
        *id
    }
}

impl From<&WorkerHandle> for WorkerId {
    fn from(handle: &WorkerHandle) -> Self {
        handle.id()
    }
}

/// Lifecycle state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Can send and receive.
    Active,
    /// Terminated; the handle cannot be reused.
    Stopped,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

struct Inner {
    id: WorkerId,
    label: Option<String>,
    source: WorkerSource,
    created_at: DateTime<Utc>,
    events: EventBus,
    /// `None` once stopped.
    unit: Mutex<Option<Box<dyn ExecutionUnit>>>,
}

/// Handle to one background worker.
///
/// Cheap to clone; clones share identity, subscriptions and the execution
/// unit. The unit is terminated by `stop()` or when the last clone is dropped.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<Inner>,
}

impl WorkerHandle {
    /// Spawn a worker as a child process with default host settings.
    pub fn spawn(options: WorkerOptions) -> Result<Self, ConstructionError> {
        Self::create(&ProcessHost::default(), options)
    }

    /// Spawn a worker on `host`.
    ///
    /// Must be called from within a Tokio runtime. Spawn failures are
    /// returned as-is; nothing is retried.
    pub fn create(host: &dyn WorkerHost, options: WorkerOptions) -> Result<Self, ConstructionError> {
        let WorkerOptions {
            inline,
            file,
            label,
            listeners,
        } = options;

        let source = WorkerSource::resolve(inline, file)?;

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ConstructionError::Spawn {
                origin: source.to_string(),
                reason: "no Tokio runtime is running".to_string(),
            });
        }

        let id = WorkerId::new();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let unit = host.spawn(id, &source, inbound_tx)?;

        let events = EventBus::new();
        for (event, handler) in listeners {
            events.on(&event, handler);
        }

        let inner = Arc::new(Inner {
            id,
            label,
            source,
            created_at: Utc::now(),
            events,
            unit: Mutex::new(Some(unit)),
        });

        tokio::spawn(dispatch_loop(Arc::downgrade(&inner), inbound_rx));

        info!(
            worker_id = %id,
            label = ?inner.label,
            source = %inner.source,
            "Worker created"
        );

        Ok(Self { inner })
    }

    pub fn id(&self) -> WorkerId {
        self.inner.id
    }

    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    pub fn source(&self) -> &WorkerSource {
        &self.inner.source
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn state(&self) -> WorkerState {
        if self.inner.unit.lock().is_some() {
            WorkerState::Active
        } else {
            WorkerState::Stopped
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == WorkerState::Active
    }

    // ── Sending ─────────────────────────────────────────────────────────

    /// Send a plain text message, verbatim.
    pub fn send_text(&self, text: &str) -> Result<(), WorkerError> {
        self.transmit(std::iter::once(WorkerMessage::text(text)))
    }

    /// Send a dynamically typed payload as a plain message.
    ///
    /// Only strings are accepted; anything else is `InvalidPayload` and
    /// nothing is sent.
    pub fn post(&self, payload: &Value) -> Result<(), WorkerError> {
        match payload {
            Value::String(text) => self.send_text(text),
            other => Err(WorkerError::InvalidPayload {
                reason: format!("expected a string, got {}", json_kind(other)),
            }),
        }
    }

    /// Send `data` tagged with each of `names`, one message per name, in order.
    pub fn send_events(&self, names: impl Into<EventNames>, data: Value) -> Result<(), WorkerError> {
        let names = names.into();
        if names.iter().any(str::is_empty) {
            return Err(WorkerError::InvalidPayload {
                reason: "event names must not be empty".to_string(),
            });
        }
        self.transmit(names.iter().map(|name| WorkerMessage::tagged(name, data.clone())))
    }

    /// Post a batch under one lock so it reaches the unit contiguously.
    fn transmit(&self, messages: impl IntoIterator<Item = WorkerMessage>) -> Result<(), WorkerError> {
        let unit = self.inner.unit.lock();
        let Some(unit) = unit.as_ref() else {
            return Err(WorkerError::Stopped { id: self.id() });
        };
        for message in messages {
            trace!(worker_id = %self.id(), event = ?message.event(), "Sending to worker");
            unit.post(message)
                .map_err(|_| WorkerError::Disconnected { id: self.id() })?;
        }
        Ok(())
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    /// Subscribe to `event`. Handlers for one event fire in registration order.
    pub fn on<F>(&self, event: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&WorkerHandle, &Value) + Send + Sync + 'static,
    {
        self.inner.events.on(event, Arc::new(handler))
    }

    /// Subscribe an already shared handler.
    pub fn on_shared(&self, event: &str, handler: EventHandler) -> SubscriptionId {
        self.inner.events.on(event, handler)
    }

    /// Remove a subscription. Returns false if it was not present.
    pub fn off(&self, event: &str, id: SubscriptionId) -> bool {
        self.inner.events.off(event, id)
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.events.listener_count(event)
    }

    /// Fire `event` locally with `data`, as if the worker had emitted it.
    pub fn fire(&self, event: &str, data: &Value) -> usize {
        self.inner.events.fire(self, event, data)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Terminate the execution unit immediately. Terminal.
    ///
    /// Messages already queued may or may not be processed. Stopping a
    /// stopped handle does nothing.
    pub fn stop(&self) -> Result<(), WorkerError> {
        let Some(unit) = self.inner.unit.lock().take() else {
            debug!(worker_id = %self.id(), "Worker already stopped");
            return Ok(());
        };

        let result = unit.terminate();
        drop(unit);

        match result {
            Ok(()) => {
                info!(worker_id = %self.id(), label = ?self.label(), "Worker stopped");
                Ok(())
            }
            Err(e) => {
                warn!(worker_id = %self.id(), error = %e, "Worker did not terminate cleanly");
                Err(WorkerError::Terminate {
                    id: self.id(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Route one inbound item to subscribers.
    fn dispatch(&self, inbound: Inbound) {
        match inbound {
            Inbound::Message(message) => {
                self.fire(MESSAGE_EVENT, &message.to_value());

                if let WorkerMessage::Tagged { event, data } = &message {
                    self.fire(event, data);
                }
            }
            Inbound::Failure(failure) => {
                warn!(
                    worker_id = %self.id(),
                    kind = %failure.kind,
                    message = %failure.message,
                    "Worker execution failure"
                );
                self.fire(ERROR_EVENT, &failure.to_value());
            }
        }
    }
}

impl PartialEq for WorkerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for WorkerHandle {}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id())
            .field("label", &self.inner.label)
            .field("source", &self.inner.source)
            .field("state", &self.state())
            .finish()
    }
}

/// Deliver inbound items in arrival order until the unit or every handle is gone.
async fn dispatch_loop(inner: Weak<Inner>, mut inbound_rx: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(inbound) = inbound_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let handle = WorkerHandle { inner };
        if !handle.is_active() {
            trace!(worker_id = %handle.id(), "Dropping inbound item for stopped worker");
            continue;
        }
        handle.dispatch(inbound);
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::error::{ExecutionFailure, FailureKind};
    use crate::worker::testing::{LoopbackHost, Recorder};

    fn event(name: &str, data: Value) -> (String, Value) {
        (name.to_string(), data)
    }

    #[tokio::test]
    async fn plain_text_fires_only_message() {
        let host = LoopbackHost::echo();
        let handle = WorkerHandle::create(&host, WorkerOptions::inline("echo")).unwrap();
        let mut rec = Recorder::attach(&host, &handle, &["message", "x", "error"]);

        handle.send_text("x").unwrap();

        assert_eq!(rec.drain().await, vec![event("message", json!("x"))]);
    }

    #[tokio::test]
    async fn tagged_fires_message_then_named_event_in_order() {
        let host = LoopbackHost::echo();
        let handle = WorkerHandle::create(&host, WorkerOptions::inline("echo")).unwrap();
        let mut rec = Recorder::attach(&host, &handle, &["message", "a", "b"]);

        let data = json!({"n": 1});
        handle.send_events(["a", "b"], data.clone()).unwrap();

        assert_eq!(
            host.posted(),
            vec![
                WorkerMessage::tagged("a", data.clone()),
                WorkerMessage::tagged("b", data.clone()),
            ]
        );
        assert_eq!(
            rec.drain().await,
            vec![
                event("message", json!({"event": "a", "data": {"n": 1}})),
                event("a", data.clone()),
                event("message", json!({"event": "b", "data": {"n": 1}})),
                event("b", data),
            ]
        );
    }

    #[tokio::test]
    async fn failure_fires_only_error() {
        let host = LoopbackHost::silent();
        let handle = WorkerHandle::create(&host, WorkerOptions::inline("noop")).unwrap();
        let mut rec = Recorder::attach(&host, &handle, &["message", "error"]);

        host.inject(
            handle.id(),
            Inbound::Failure(ExecutionFailure::new(FailureKind::Stderr, "boom")),
        );

        let log = rec.drain().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "error");
        assert_eq!(log[0].1["kind"], "stderr");
        assert_eq!(log[0].1["message"], "boom");
        assert!(handle.is_active());
    }

    #[tokio::test]
    async fn tagged_error_and_message_names_fire_like_any_other() {
        let host = LoopbackHost::silent();
        let handle = WorkerHandle::create(&host, WorkerOptions::inline("noop")).unwrap();
        let mut rec = Recorder::attach(&host, &handle, &["message", "error"]);

        host.inject(
            handle.id(),
            Inbound::Message(WorkerMessage::decode(r#"{"event":"error","data":"app level"}"#)),
        );
        host.inject(
            handle.id(),
            Inbound::Message(WorkerMessage::decode(r#"{"event":"message","data":1}"#)),
        );

        assert_eq!(
            rec.drain().await,
            vec![
                event("message", json!({"event": "error", "data": "app level"})),
                event("error", json!("app level")),
                event("message", json!({"event": "message", "data": 1})),
                event("message", json!(1)),
            ]
        );
    }

    #[tokio::test]
    async fn post_rejects_non_text() {
        let host = LoopbackHost::silent();
        let handle = WorkerHandle::create(&host, WorkerOptions::inline("noop")).unwrap();

        let err = handle.post(&json!({"a": 1})).unwrap_err();
        assert!(matches!(err, WorkerError::InvalidPayload { .. }));
        assert!(host.posted().is_empty());

        handle.post(&json!("ok")).unwrap();
        assert_eq!(host.posted(), vec![WorkerMessage::text("ok")]);
    }

    #[tokio::test]
    async fn empty_event_name_sends_nothing() {
        let host = LoopbackHost::silent();
        let handle = WorkerHandle::create(&host, WorkerOptions::inline("noop")).unwrap();

        let err = handle.send_events(["ok", ""], json!(1)).unwrap_err();
        assert!(matches!(err, WorkerError::InvalidPayload { .. }));
        assert!(host.posted().is_empty());
    }

    #[tokio::test]
    async fn handlers_fire_in_registration_order_and_can_unsubscribe() {
        let host = LoopbackHost::echo();
        let handle = WorkerHandle::create(&host, WorkerOptions::inline("echo")).unwrap();
        let mut rec = Recorder::attach(&host, &handle, &[]);
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let order = Arc::clone(&order);
            handle.on("tick", move |_, _| order.lock().push(1))
        };
        {
            let order = Arc::clone(&order);
            handle.on("tick", move |_, _| order.lock().push(2));
        }

        handle.send_events("tick", Value::Null).unwrap();
        rec.drain().await;
        assert_eq!(*order.lock(), vec![1, 2]);

        assert!(handle.off("tick", first));
        assert!(!handle.off("tick", first));
        handle.send_events("tick", Value::Null).unwrap();
        rec.drain().await;
        assert_eq!(*order.lock(), vec![1, 2, 2]);
    }

    #[tokio::test]
    async fn handler_receives_the_emitting_handle() {
        let host = LoopbackHost::echo();
        let handle =
            WorkerHandle::create(&host, WorkerOptions::inline("echo").with_label("w0")).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        handle.on("message", move |ww, _| {
            let _ = tx.send((ww.id(), ww.label().map(str::to_string)));
        });

        handle.send_text("hi").unwrap();

        let seen = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("dispatch timed out");
        assert_eq!(seen, Some((handle.id(), Some("w0".to_string()))));
    }

    #[tokio::test]
    async fn listeners_from_options_are_subscribed_before_start() {
        let host = LoopbackHost::greeting("ready");
        let log = Arc::new(Mutex::new(Vec::new()));
        let options = {
            let log = Arc::clone(&log);
            WorkerOptions::inline("greet")
                .with_listener("message", move |_, data| log.lock().push(data.clone()))
        };

        let handle = WorkerHandle::create(&host, options).unwrap();
        Recorder::attach(&host, &handle, &[]).drain().await;

        // The flush marker also reaches the early listener, after the greeting.
        assert_eq!(log.lock().first(), Some(&json!("ready")));
    }

    #[tokio::test]
    async fn stop_is_terminal() {
        let host = LoopbackHost::echo();
        let handle = WorkerHandle::create(&host, WorkerOptions::inline("echo")).unwrap();
        assert_eq!(handle.state(), WorkerState::Active);

        handle.stop().unwrap();
        assert_eq!(handle.state(), WorkerState::Stopped);
        assert!(host.terminated());

        assert!(matches!(handle.send_text("x"), Err(WorkerError::Stopped { .. })));
        assert!(matches!(
            handle.send_events("a", json!(1)),
            Err(WorkerError::Stopped { .. })
        ));
        // Second stop is a no-op.
        handle.stop().unwrap();
    }

    #[tokio::test]
    async fn failing_terminate_still_stops_the_handle() {
        let host = LoopbackHost::echo().failing_terminate();
        let handle = WorkerHandle::create(&host, WorkerOptions::inline("echo")).unwrap();

        let err = handle.stop().unwrap_err();
        assert!(matches!(err, WorkerError::Terminate { .. }));
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn inbound_after_stop_is_dropped() {
        let host = LoopbackHost::silent();
        let handle = WorkerHandle::create(&host, WorkerOptions::inline("noop")).unwrap();
        let mut rec = Recorder::attach(&host, &handle, &["message"]);

        handle.stop().unwrap();
        host.inject(handle.id(), Inbound::Message(WorkerMessage::text("late")));

        rec.assert_quiet().await;
    }

    #[tokio::test]
    async fn construction_rejects_bad_sources() {
        let host = LoopbackHost::echo();

        let both = WorkerOptions::inline("echo").with_file("worker.sh");
        assert!(matches!(
            WorkerHandle::create(&host, both),
            Err(ConstructionError::AmbiguousSource { .. })
        ));

        assert!(matches!(
            WorkerHandle::create(&host, WorkerOptions::default()),
            Err(ConstructionError::MissingSource)
        ));
        assert_eq!(host.spawn_count(), 0);
    }

    #[test]
    fn construction_outside_runtime_fails() {
        let host = LoopbackHost::echo();
        let err = WorkerHandle::create(&host, WorkerOptions::inline("echo")).unwrap_err();
        assert!(matches!(err, ConstructionError::Spawn { .. }));
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let host = LoopbackHost::echo();
        let a = WorkerHandle::create(&host, WorkerOptions::inline("echo")).unwrap();
        let b = WorkerHandle::create(&host, WorkerOptions::inline("echo")).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone(), a);
    }
}
