//! Worker construction inputs.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use crate::error::ConstructionError;

use super::events::EventHandler;
use super::handle::WorkerHandle;

/// Where a worker's code comes from. Exactly one kind per worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerSource {
    /// Code text run through the host's interpreter.
    Inline(String),
    /// Externally stored code, referenced by path.
    File(PathBuf),
}

impl WorkerSource {
    /// Pick the single source out of the two optional inputs.
    ///
    /// Empty inline text or an empty path count as absent.
    pub fn resolve(
        inline: Option<String>,
        file: Option<PathBuf>,
    ) -> Result<Self, ConstructionError> {
        let inline = inline.filter(|code| !code.trim().is_empty());
        let file = file.filter(|path| !path.as_os_str().is_empty());

        match (inline, file) {
            (Some(code), None) => Ok(Self::Inline(code)),
            (None, Some(path)) => Ok(Self::File(path)),
            (Some(_), Some(path)) => Err(ConstructionError::AmbiguousSource { file: path }),
            (None, None) => Err(ConstructionError::MissingSource),
        }
    }
}

impl std::fmt::Display for WorkerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inline(code) => write!(f, "inline code ({} bytes)", code.len()),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Options for creating a worker handle.
///
/// Listeners given here are subscribed before the worker starts, so they
/// cannot miss its first messages.
#[derive(Default)]
pub struct WorkerOptions {
    pub inline: Option<String>,
    pub file: Option<PathBuf>,
    pub label: Option<String>,
    pub(crate) listeners: Vec<(String, EventHandler)>,
}

impl WorkerOptions {
    /// Options for a worker running inline code.
    pub fn inline(code: impl Into<String>) -> Self {
        Self {
            inline: Some(code.into()),
            ..Default::default()
        }
    }

    /// Options for a worker running a code file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            file: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn with_inline(mut self, code: impl Into<String>) -> Self {
        self.inline = Some(code.into());
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Subscribe a handler before the worker is spawned.
    pub fn with_listener<F>(mut self, event: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&WorkerHandle, &Value) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        self.listeners.push((event.into(), handler));
        self
    }
}

impl std::fmt::Debug for WorkerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerOptions")
            .field("inline", &self.inline.as_ref().map(|code| code.len()))
            .field("file", &self.file)
            .field("label", &self.label)
            .field(
                "listeners",
                &self.listeners.iter().map(|(e, _)| e.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
