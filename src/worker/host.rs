//! Execution hosts — how workers are spawned and talked to.
//!
//! `ProcessHost` runs each worker as a child process:
//! - inline code via `<interpreter> <flag> <code>` (default `sh -c`)
//! - file sources executed directly or through a configured runner
//! - newline-delimited JSON on stdin (outbound) and stdout (inbound)
//! - stderr lines and abnormal exits reported as execution failures
//! - output that is not valid UTF-8 decoded lossily, never fatal

use std::borrow::Cow;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::error::{ConstructionError, ExecutionFailure, FailureKind};

use super::handle::WorkerId;
use super::message::WorkerMessage;
use super::source::WorkerSource;

/// Something arriving from an execution unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// An application message emitted by the worker.
    Message(WorkerMessage),
    /// A runtime fault of the unit itself.
    Failure(ExecutionFailure),
}

/// Channel the unit uses to deliver inbound items to its handle.
pub type InboundSender = mpsc::UnboundedSender<Inbound>;

/// The unit no longer accepts messages.
#[derive(Debug, thiserror::Error)]
#[error("execution unit is closed")]
pub struct UnitClosed;

/// A spawned worker as seen by its owning handle.
pub trait ExecutionUnit: Send + Sync {
    /// Queue a message for delivery. Never blocks.
    fn post(&self, message: WorkerMessage) -> Result<(), UnitClosed>;

    /// Terminate immediately, without draining queued messages.
    ///
    /// Errors if the unit could not be signalled. Terminating a unit that
    /// already ended is not an error.
    fn terminate(&self) -> std::io::Result<()>;
}

/// Spawns execution units.
pub trait WorkerHost: Send + Sync {
    fn spawn(
        &self,
        id: WorkerId,
        source: &WorkerSource,
        inbound: InboundSender,
    ) -> Result<Box<dyn ExecutionUnit>, ConstructionError>;
}

/// Host that runs each worker as a child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessHost {
    config: HostConfig,
}

impl ProcessHost {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    fn command(&self, source: &WorkerSource) -> Command {
        match source {
            WorkerSource::Inline(code) => {
                let mut c = Command::new(&self.config.interpreter);
                if !self.config.inline_flag.is_empty() {
                    c.arg(&self.config.inline_flag);
                }
                c.arg(code);
                c
            }
            WorkerSource::File(path) => match &self.config.file_runner {
                Some(runner) => {
                    let mut c = Command::new(runner);
                    c.arg(path);
                    c
                }
                None => Command::new(path),
            },
        }
    }
}

impl WorkerHost for ProcessHost {
    fn spawn(
        &self,
        id: WorkerId,
        source: &WorkerSource,
        inbound: InboundSender,
    ) -> Result<Box<dyn ExecutionUnit>, ConstructionError> {
        let spawn_error = |reason: String| ConstructionError::Spawn {
            origin: source.to_string(),
            reason,
        };

        let mut command = self.command(source);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| spawn_error(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("child stdin not available".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("child stdout not available".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_error("child stderr not available".to_string()))?;

        info!(
            worker_id = %id,
            pid = ?child.id(),
            source = %source,
            "Spawned worker process"
        );

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (dropped_tx, dropped_rx) = oneshot::channel();
        let child = Arc::new(Mutex::new(ChildSlot {
            child,
            terminated: false,
        }));

        tokio::spawn(stdin_writer(id, stdin, outbound_rx, inbound.clone()));
        tokio::spawn(stdout_reader(id, stdout, inbound.clone()));
        tokio::spawn(stderr_reader(id, stderr, inbound.clone(), self.config.forward_stderr));
        tokio::spawn(supervise(id, Arc::clone(&child), dropped_rx, inbound));

        Ok(Box::new(ProcessUnit {
            outbound_tx,
            child,
            _dropped_tx: dropped_tx,
        }))
    }
}

/// How often the supervisor checks whether the child has exited.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// The child process, shared by its unit and its supervisor.
struct ChildSlot {
    child: Child,
    /// Set once `terminate` has signalled the child or found it gone.
    terminated: bool,
}

/// A worker child process.
struct ProcessUnit {
    outbound_tx: mpsc::UnboundedSender<WorkerMessage>,
    child: Arc<Mutex<ChildSlot>>,
    /// Closes when the unit is dropped, telling the supervisor to kill the child.
    _dropped_tx: oneshot::Sender<()>,
}

impl ExecutionUnit for ProcessUnit {
    fn post(&self, message: WorkerMessage) -> Result<(), UnitClosed> {
        self.outbound_tx.send(message).map_err(|_| UnitClosed)
    }

    fn terminate(&self) -> std::io::Result<()> {
        let mut slot = self.child.lock();
        if slot.terminated {
            return Ok(());
        }
        if slot.child.try_wait()?.is_none() {
            slot.child.start_kill()?;
        }
        slot.terminated = true;
        Ok(())
    }
}

/// Write outbound messages to the child's stdin, one line each.
async fn stdin_writer(
    id: WorkerId,
    mut stdin: ChildStdin,
    mut outbound_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    inbound: InboundSender,
) {
    while let Some(message) = outbound_rx.recv().await {
        let mut line = message.encode();
        line.push('\n');

        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = written {
            warn!(worker_id = %id, error = %e, "Failed to write to worker stdin");
            let _ = inbound.send(Inbound::Failure(ExecutionFailure::new(
                FailureKind::Io,
                format!("failed to write to worker: {e}"),
            )));
            break;
        }
    }
    debug!(worker_id = %id, "Worker stdin writer stopped");
}

/// Read one `\n`-terminated line into `buf`. Returns false at EOF.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    Ok(reader.read_until(b'\n', buf).await? > 0)
}

/// Strip the line terminator and decode, replacing invalid UTF-8.
fn decode_line(buf: &[u8]) -> Cow<'_, str> {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line)
}

/// Decode stdout lines into inbound messages.
async fn stdout_reader(id: WorkerId, stdout: ChildStdout, inbound: InboundSender) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        match read_line(&mut reader, &mut buf).await {
            Ok(true) => {
                let line = decode_line(&buf);
                if line.trim().is_empty() {
                    continue;
                }
                if inbound.send(Inbound::Message(WorkerMessage::decode(&line))).is_err() {
                    break;
                }
            }
            Ok(false) => break, // EOF
            Err(e) => {
                warn!(worker_id = %id, error = %e, "Failed to read worker stdout");
                let _ = inbound.send(Inbound::Failure(ExecutionFailure::new(
                    FailureKind::Io,
                    format!("failed to read from worker: {e}"),
                )));
                break;
            }
        }
    }
    debug!(worker_id = %id, "Worker stdout reader stopped");
}

/// Log stderr lines and optionally report them as failures.
async fn stderr_reader(id: WorkerId, stderr: ChildStderr, inbound: InboundSender, forward: bool) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        match read_line(&mut reader, &mut buf).await {
            Ok(true) => {
                let line = decode_line(&buf).into_owned();
                warn!(worker_id = %id, stderr = %line, "Worker wrote to stderr");
                if forward
                    && inbound
                        .send(Inbound::Failure(ExecutionFailure::new(FailureKind::Stderr, line)))
                        .is_err()
                {
                    break;
                }
            }
            Ok(false) => break,
            Err(e) => {
                warn!(worker_id = %id, error = %e, "Failed to read worker stderr");
                break;
            }
        }
    }
    debug!(worker_id = %id, "Worker stderr reader stopped");
}

/// Watch the child until it exits, is terminated, or its unit is dropped.
async fn supervise(
    id: WorkerId,
    child: Arc<Mutex<ChildSlot>>,
    mut unit_dropped: oneshot::Receiver<()>,
    inbound: InboundSender,
) {
    loop {
        let polled = {
            let mut slot = child.lock();
            if slot.terminated {
                debug!(worker_id = %id, "Worker process terminated");
                return;
            }
            slot.child.try_wait()
        };

        match polled {
            Ok(Some(status)) => {
                report_exit(id, status, &inbound);
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(worker_id = %id, error = %e, "Failed to wait on worker process");
                let _ = inbound.send(Inbound::Failure(ExecutionFailure::new(
                    FailureKind::Io,
                    format!("failed to wait on worker: {e}"),
                )));
                return;
            }
        }

        tokio::select! {
            _ = &mut unit_dropped => {
                let mut slot = child.lock();
                if !slot.terminated {
                    if let Err(e) = slot.child.start_kill() {
                        warn!(worker_id = %id, error = %e, "Failed to kill dropped worker process");
                    }
                }
                debug!(worker_id = %id, "Worker unit dropped");
                return;
            }
            _ = tokio::time::sleep(EXIT_POLL_INTERVAL) => {}
        }
    }
}

fn report_exit(id: WorkerId, status: ExitStatus, inbound: &InboundSender) {
    if status.success() {
        info!(worker_id = %id, "Worker process exited");
    } else {
        warn!(worker_id = %id, code = ?status.code(), "Worker process exited abnormally");
        let _ = inbound.send(Inbound::Failure(ExecutionFailure::exited(status.code())));
    }
}
