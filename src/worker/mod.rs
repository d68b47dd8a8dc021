//! Worker system — one handle per background execution unit.
//!
//! Core components:
//! - `handle`: `WorkerHandle` lifecycle, sending, inbound dispatch
//! - `events`: per-handle publish/subscribe table (`message`, `error`, named events)
//! - `message`: plain/tagged wire messages and their line encoding
//! - `source`: inline code vs. code file, construction options
//! - `host`: `WorkerHost` / `ExecutionUnit` seams and the child-process host

pub mod events;
pub mod handle;
pub mod host;
pub mod message;
pub mod source;

#[cfg(test)]
pub(crate) mod testing;

pub use events::{ERROR_EVENT, EventBus, EventHandler, MESSAGE_EVENT, SubscriptionId};
pub use handle::{WorkerHandle, WorkerId, WorkerState};
pub use host::{ExecutionUnit, Inbound, InboundSender, ProcessHost, UnitClosed, WorkerHost};
pub use message::{EventNames, WorkerMessage};
pub use source::{WorkerOptions, WorkerSource};
