//! worker-hub — background workers behind typed handles, plus a registry for
//! addressing them as a group.

pub mod config;
pub mod error;
pub mod registry;
pub mod worker;

pub use config::HostConfig;
pub use error::{ConfigError, ConstructionError, ExecutionFailure, StopAllError, WorkerError};
pub use registry::{Delivery, Subscription, WorkerRegistry};
pub use worker::{
    ERROR_EVENT, MESSAGE_EVENT, ProcessHost, WorkerHandle, WorkerId, WorkerMessage,
    WorkerOptions, WorkerSource, WorkerState,
};
