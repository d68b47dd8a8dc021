//! In-memory host and event recorder for unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::ConstructionError;

use super::events::MESSAGE_EVENT;
use super::handle::{WorkerHandle, WorkerId};
use super::host::{ExecutionUnit, Inbound, InboundSender, UnitClosed, WorkerHost};
use super::message::WorkerMessage;
use super::source::WorkerSource;

#[derive(Default)]
struct State {
    posted: Vec<WorkerMessage>,
    inbound: HashMap<WorkerId, InboundSender>,
    terminated: usize,
    spawns: usize,
}

/// Host whose units record what they receive and optionally echo it back.
#[derive(Clone)]
pub(crate) struct LoopbackHost {
    echo: bool,
    greeting: Option<String>,
    fail_terminate: bool,
    state: Arc<Mutex<State>>,
}

impl LoopbackHost {
    fn build(echo: bool, greeting: Option<String>) -> Self {
        Self {
            echo,
            greeting,
            fail_terminate: false,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Units send every posted message straight back.
    pub(crate) fn echo() -> Self {
        Self::build(true, None)
    }

    /// Units only record what they receive.
    pub(crate) fn silent() -> Self {
        Self::build(false, None)
    }

    /// Units emit `text` as soon as they start.
    pub(crate) fn greeting(text: &str) -> Self {
        Self::build(false, Some(text.to_string()))
    }

    /// Units report an error from `terminate`.
    pub(crate) fn failing_terminate(mut self) -> Self {
        self.fail_terminate = true;
        self
    }

    pub(crate) fn posted(&self) -> Vec<WorkerMessage> {
        self.state.lock().posted.clone()
    }

    pub(crate) fn terminated(&self) -> bool {
        self.state.lock().terminated > 0
    }

    pub(crate) fn spawn_count(&self) -> usize {
        self.state.lock().spawns
    }

    /// Deliver an inbound item as if the unit behind `id` had produced it.
    pub(crate) fn inject(&self, id: WorkerId, inbound: Inbound) {
        if let Some(tx) = self.state.lock().inbound.get(&id) {
            let _ = tx.send(inbound);
        }
    }
}

impl WorkerHost for LoopbackHost {
    fn spawn(
        &self,
        id: WorkerId,
        _source: &WorkerSource,
        inbound: InboundSender,
    ) -> Result<Box<dyn ExecutionUnit>, ConstructionError> {
        if let Some(text) = &self.greeting {
            let _ = inbound.send(Inbound::Message(WorkerMessage::text(text.as_str())));
        }
        {
            let mut state = self.state.lock();
            state.spawns += 1;
            state.inbound.insert(id, inbound.clone());
        }
        Ok(Box::new(LoopbackUnit {
            echo: self.echo,
            fail_terminate: self.fail_terminate,
            inbound,
            state: Arc::clone(&self.state),
        }))
    }
}

struct LoopbackUnit {
    echo: bool,
    fail_terminate: bool,
    inbound: InboundSender,
    state: Arc<Mutex<State>>,
}

impl ExecutionUnit for LoopbackUnit {
    fn post(&self, message: WorkerMessage) -> Result<(), UnitClosed> {
        self.state.lock().posted.push(message.clone());
        if self.echo {
            self.inbound
                .send(Inbound::Message(message))
                .map_err(|_| UnitClosed)?;
        }
        Ok(())
    }

    fn terminate(&self) -> std::io::Result<()> {
        self.state.lock().terminated += 1;
        if self.fail_terminate {
            return Err(std::io::Error::other("terminate refused"));
        }
        Ok(())
    }
}

// ── Recorder ────────────────────────────────────────────────────────

/// Upper bound for any single wait on a dispatch task.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Sent through a unit's inbound queue to mark everything before it as dispatched.
const FLUSH_MARKER: &str = "\u{1}flush";

/// Collects the events one handle fires, in dispatch order.
pub(crate) struct Recorder {
    id: WorkerId,
    host: LoopbackHost,
    rx: mpsc::UnboundedReceiver<(String, Value)>,
}

impl Recorder {
    /// Subscribe to `events` on `handle`, which must have been created by `host`.
    pub(crate) fn attach(host: &LoopbackHost, handle: &WorkerHandle, events: &[&str]) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            let tx = tx.clone();
            let name = event.to_string();
            handle.on(event, move |_, data| {
                if data.as_str() != Some(FLUSH_MARKER) {
                    let _ = tx.send((name.clone(), data.clone()));
                }
            });
        }
        handle.on(MESSAGE_EVENT, move |_, data| {
            if data.as_str() == Some(FLUSH_MARKER) {
                let _ = tx.send((String::new(), data.clone()));
            }
        });
        Self {
            id: handle.id(),
            host: host.clone(),
            rx,
        }
    }

    /// Wait until every inbound item queued so far has been dispatched and
    /// return the events recorded since the last drain.
    pub(crate) async fn drain(&mut self) -> Vec<(String, Value)> {
        self.host
            .inject(self.id, Inbound::Message(WorkerMessage::text(FLUSH_MARKER)));

        let mut seen = Vec::new();
        loop {
            let (event, data) = timeout(DISPATCH_TIMEOUT, self.rx.recv())
                .await
                .expect("dispatch timed out")
                .expect("recorder channel closed");
            if data.as_str() == Some(FLUSH_MARKER) {
                return seen;
            }
            seen.push((event, data));
        }
    }

    /// Assert nothing is recorded within a short grace period.
    ///
    /// For stopped handles, where a flush marker would be dropped too.
    pub(crate) async fn assert_quiet(&mut self) {
        let extra = timeout(Duration::from_millis(100), self.rx.recv()).await;
        assert!(extra.is_err(), "unexpected event: {extra:?}");
    }
}
