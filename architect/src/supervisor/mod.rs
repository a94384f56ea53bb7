//! Agent process supervision
//!
//! One `ProcessHandle` owns one child process for the lifetime of one
//! request: it feeds the prompt to stdin, drains stdout/stderr, enforces the
//! wall-clock deadline and reaps the child on every terminal transition.

use std::{
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin, Command},
    sync::mpsc,
    time::sleep_until,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Which pipe an output chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    /// `None` when the process was terminated by a signal.
    Exited(Option<i32>),
    TimedOut,
    LaunchFailed,
    Cancelled,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessState::Starting | ProcessState::Running)
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("Command not allowed: {0}")]
    DisallowedCommand(String),

    #[error("Failed to start {command}: {reason}")]
    LaunchFailed { command: String, reason: String },

    #[error("Agent process failed with exit code {exit_code}: {diagnostic}")]
    ProcessFailed { exit_code: i32, diagnostic: String },

    #[error("Workflow timeout exceeded after {0:?}")]
    TimedOut(Duration),

    #[error("Agent process cancelled")]
    Cancelled,

    #[error("IO error while supervising agent: {0}")]
    Io(String),
}

impl SupervisorError {
    /// Exit code surfaced to clients. Timeouts report `-1`.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SupervisorError::ProcessFailed { exit_code, .. } => Some(*exit_code),
            SupervisorError::TimedOut(_) => Some(-1),
            _ => None,
        }
    }
}

/// A single agent launch.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub command: String,
    pub args: Vec<String>,
    /// Written to stdin, which is then closed
    pub input: Vec<u8>,
    pub deadline: Duration,
    pub working_dir: Option<PathBuf>,
}

impl AgentInvocation {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        input: impl Into<Vec<u8>>,
        deadline: Duration,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            input: input.into(),
            deadline,
            working_dir: None,
        }
    }

    pub fn working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }
}

/// Everything a successful run produced.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl ProcessOutput {
    /// stdout followed by stderr, the text payload extraction runs over.
    pub fn combined(&self) -> String {
        let mut combined = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&self.stderr);
        }
        combined
    }
}

#[derive(Debug)]
pub enum ProcessEvent {
    /// A chunk was appended to the output buffer.
    Output { stream: OutputStream, bytes: usize },
    /// The process reached a terminal state and has been reaped.
    Finished(Result<ProcessOutput, SupervisorError>),
}

struct OutputChunk {
    stream: OutputStream,
    data: Bytes,
}

/// Launches agent processes from a fixed allow-list.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    allowed_commands: Vec<String>,
}

impl ProcessSupervisor {
    pub fn new(allowed_commands: Vec<String>) -> Self {
        Self { allowed_commands }
    }

    pub fn is_allowed(&self, command: &str) -> bool {
        self.allowed_commands.iter().any(|allowed| allowed == command)
    }

    /// Spawn the process and start draining its output.
    ///
    /// Nothing is spawned for commands outside the allow-list. The deadline
    /// starts now.
    pub fn spawn(&self, invocation: AgentInvocation) -> Result<ProcessHandle, SupervisorError> {
        if !self.is_allowed(&invocation.command) {
            warn!(command = %invocation.command, "refusing to launch command outside allow-list");
            return Err(SupervisorError::DisallowedCommand(invocation.command));
        }

        let mut command = Command::new(&invocation.command);
        command
            .args(&invocation.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            error!(command = %invocation.command, "failed to spawn agent: {e}");
            SupervisorError::LaunchFailed {
                command: invocation.command.clone(),
                reason: e.to_string(),
            }
        })?;

        let pid = child.id();
        let (tx, output_rx) = mpsc::channel(64);
        if let Some(stdout) = child.stdout.take() {
            drain(stdout, OutputStream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            drain(stderr, OutputStream::Stderr, tx);
        }

        info!(command = %invocation.command, ?pid, deadline = ?invocation.deadline, "agent process started");

        Ok(ProcessHandle {
            command: invocation.command,
            pid,
            stdin: child.stdin.take(),
            pending_input: Some(invocation.input),
            child,
            state: ProcessState::Starting,
            output_rx,
            output_closed: false,
            stdout: Vec::new(),
            stderr: Vec::new(),
            started_at: Instant::now(),
            timeout: invocation.deadline,
            deadline: tokio::time::Instant::now() + invocation.deadline,
        })
    }

    /// Run an invocation to completion, accumulating all output.
    pub async fn invoke(
        &self,
        invocation: AgentInvocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, SupervisorError> {
        let mut handle = self.spawn(invocation)?;
        handle.send_input(cancel).await?;
        while let Some(event) = handle.next(cancel).await {
            if let ProcessEvent::Finished(result) = event {
                return result;
            }
        }
        Err(SupervisorError::Io("agent process finished without an outcome".to_string()))
    }
}

fn drain<R>(mut reader: R, stream: OutputStream, tx: mpsc::Sender<OutputChunk>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = OutputChunk {
                        stream,
                        data: Bytes::copy_from_slice(&buf[..n]),
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(?stream, error = %e, "agent output pipe closed with error");
                    break;
                }
            }
        }
    });
}

enum Step {
    Cancelled,
    DeadlineElapsed,
    Chunk(Option<OutputChunk>),
    Exited(std::io::Result<ExitStatus>),
}

/// One live agent process. Killed when dropped.
pub struct ProcessHandle {
    command: String,
    pid: Option<u32>,
    child: Child,
    stdin: Option<ChildStdin>,
    pending_input: Option<Vec<u8>>,
    state: ProcessState,
    output_rx: mpsc::Receiver<OutputChunk>,
    output_closed: bool,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    started_at: Instant,
    timeout: Duration,
    deadline: tokio::time::Instant,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    /// Write the input payload and close stdin.
    ///
    /// An agent that exits without reading its input is not an error here;
    /// its exit status decides the outcome.
    pub async fn send_input(&mut self, cancel: &CancellationToken) -> Result<(), SupervisorError> {
        let (Some(mut stdin), Some(input)) = (self.stdin.take(), self.pending_input.take()) else {
            return Ok(());
        };
        self.state = ProcessState::Running;

        let write = async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.terminate(ProcessState::Cancelled).await;
                Err(SupervisorError::Cancelled)
            }
            _ = sleep_until(self.deadline) => {
                warn!(command = %self.command, pid = ?self.pid, "agent deadline elapsed while sending input");
                self.terminate(ProcessState::TimedOut).await;
                Err(SupervisorError::TimedOut(self.timeout))
            }
            result = write => {
                if let Err(e) = result {
                    debug!(pid = ?self.pid, error = %e, "agent closed stdin before reading all input");
                }
                Ok(())
            }
        }
    }

    /// Wait for the next output chunk or the terminal outcome.
    ///
    /// Returns `None` once `Finished` has been delivered.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Option<ProcessEvent> {
        if self.state.is_terminal() {
            return None;
        }
        if self.state == ProcessState::Starting {
            self.state = ProcessState::Running;
        }

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                _ = sleep_until(self.deadline) => Step::DeadlineElapsed,
                chunk = self.output_rx.recv(), if !self.output_closed => Step::Chunk(chunk),
                status = self.child.wait(), if self.output_closed => Step::Exited(status),
            };

            match step {
                Step::Cancelled => {
                    info!(command = %self.command, pid = ?self.pid, "agent cancelled; killing process");
                    self.terminate(ProcessState::Cancelled).await;
                    return Some(ProcessEvent::Finished(Err(SupervisorError::Cancelled)));
                }
                Step::DeadlineElapsed => {
                    warn!(command = %self.command, pid = ?self.pid, timeout = ?self.timeout, "agent deadline elapsed; killing process");
                    self.terminate(ProcessState::TimedOut).await;
                    return Some(ProcessEvent::Finished(Err(SupervisorError::TimedOut(
                        self.timeout,
                    ))));
                }
                Step::Chunk(Some(chunk)) => {
                    let bytes = chunk.data.len();
                    match chunk.stream {
                        OutputStream::Stdout => self.stdout.extend_from_slice(&chunk.data),
                        OutputStream::Stderr => self.stderr.extend_from_slice(&chunk.data),
                    }
                    return Some(ProcessEvent::Output {
                        stream: chunk.stream,
                        bytes,
                    });
                }
                Step::Chunk(None) => {
                    self.output_closed = true;
                }
                Step::Exited(status) => return Some(ProcessEvent::Finished(self.settle(status))),
            }
        }
    }

    /// Kill and reap the process if it is still running.
    pub async fn kill(&mut self) {
        if !self.state.is_terminal() {
            self.terminate(ProcessState::Cancelled).await;
        }
    }

    async fn terminate(&mut self, state: ProcessState) {
        if let Err(e) = self.child.start_kill() {
            debug!(pid = ?self.pid, error = %e, "agent already exited before kill");
        }
        match self.child.wait().await {
            Ok(status) => debug!(pid = ?self.pid, %status, "agent process reaped"),
            Err(e) => error!(pid = ?self.pid, "failed to reap agent process: {e}"),
        }
        self.state = state;
    }

    fn settle(
        &mut self,
        status: std::io::Result<ExitStatus>,
    ) -> Result<ProcessOutput, SupervisorError> {
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                self.state = ProcessState::Exited(None);
                return Err(SupervisorError::Io(e.to_string()));
            }
        };

        let exit_code = status.code();
        self.state = ProcessState::Exited(exit_code);
        let stdout = String::from_utf8_lossy(&self.stdout).to_string();
        let stderr = String::from_utf8_lossy(&self.stderr).to_string();
        let duration = self.started_at.elapsed();

        match exit_code {
            Some(code) if code != 0 => {
                warn!(command = %self.command, pid = ?self.pid, exit_code = code, "agent process failed");
                Err(SupervisorError::ProcessFailed {
                    exit_code: code,
                    diagnostic: stderr.trim().to_string(),
                })
            }
            _ => {
                info!(
                    command = %self.command,
                    pid = ?self.pid,
                    ?exit_code,
                    stdout_bytes = stdout.len(),
                    elapsed_ms = duration.as_millis() as u64,
                    "agent process completed"
                );
                Ok(ProcessOutput {
                    stdout,
                    stderr,
                    exit_code,
                    duration,
                })
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            warn!(command = %self.command, pid = ?self.pid, "agent handle dropped while running; killing process");
            let _ = self.child.start_kill();
        }
    }
}
