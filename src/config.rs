//! Configuration types.

use crate::error::ConfigError;

/// Default interpreter for inline worker code.
pub const DEFAULT_INTERPRETER: &str = "sh";

/// Default flag that makes the interpreter run its next argument as code.
pub const DEFAULT_INLINE_FLAG: &str = "-c";

/// Settings for the process host that spawns execution units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Program that runs inline code (`<interpreter> <inline_flag> <code>`).
    pub interpreter: String,
    /// Flag passed before the inline code.
    pub inline_flag: String,
    /// Optional program used to run file sources (`<runner> <file>`).
    /// When `None`, the file itself is executed.
    pub file_runner: Option<String>,
    /// Whether stderr lines from a worker are reported as `error` events.
    /// When false they are only logged.
    pub forward_stderr: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            interpreter: DEFAULT_INTERPRETER.to_string(),
            inline_flag: DEFAULT_INLINE_FLAG.to_string(),
            file_runner: None,
            forward_stderr: true,
        }
    }
}

impl HostConfig {
    /// Build config from environment variables, falling back to defaults.
    ///
    /// - `WORKER_HUB_INTERPRETER`: inline code interpreter (default `sh`)
    /// - `WORKER_HUB_INLINE_FLAG`: flag before inline code (default `-c`)
    /// - `WORKER_HUB_FILE_RUNNER`: program that runs file sources
    /// - `WORKER_HUB_FORWARD_STDERR`: `true`/`false` (default `true`)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let interpreter = lookup("WORKER_HUB_INTERPRETER")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.interpreter);

        let inline_flag = lookup("WORKER_HUB_INLINE_FLAG")
            .map(|s| s.trim().to_string())
            .unwrap_or(defaults.inline_flag);

        let file_runner = lookup("WORKER_HUB_FILE_RUNNER")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let forward_stderr = match lookup("WORKER_HUB_FORWARD_STDERR") {
            None => defaults.forward_stderr,
            Some(raw) => match raw.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "WORKER_HUB_FORWARD_STDERR".to_string(),
                        message: format!("expected a boolean, got '{other}'"),
                    });
                }
            },
        };

        Ok(Self {
            interpreter,
            inline_flag,
            file_runner,
            forward_stderr,
        })
    }

    /// Use a different interpreter for inline code.
    pub fn with_interpreter(mut self, interpreter: impl Into<String>, flag: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self.inline_flag = flag.into();
        self
    }

    /// Run file sources through `runner` instead of executing them directly.
    pub fn with_file_runner(mut self, runner: impl Into<String>) -> Self {
        self.file_runner = Some(runner.into());
        self
    }
}
