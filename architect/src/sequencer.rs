//! Event sequencing for generation sessions
//!
//! Wraps one supervised agent run in an ordered stream of [`StreamEvent`]s.
//! The agent only yields a final blob, so intermediate progress is
//! synthesized from observable milestones: request accepted, input sent,
//! stdout chunks, payload parsed.

use std::{
    path::PathBuf,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::Stream;
use serde_json::Value;
use shared_types::{AgentRole, ErrorReport, ProgressUpdate, StreamEvent, PIPELINE_TOTAL_STEPS};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::extract::{ExtractError, PayloadExtractor};
use crate::supervisor::{
    AgentInvocation, OutputStream, ProcessEvent, ProcessSupervisor, SupervisorError,
};

const EVENT_BUFFER: usize = 32;
/// How long a blocking event send may wait on a stalled consumer.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

const STARTING_PERCENT: u8 = 5;
const INPUT_SENT_PERCENT: u8 = 14;
const CHUNK_CEILING_PERCENT: u8 = 90;
const COMPLETE_PERCENT: u8 = 100;

/// How the agent binary is launched.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub command: String,
    pub args: Vec<String>,
    /// Deadline for streamed generations
    pub stream_timeout: Duration,
    /// Deadline for one-shot role calls
    pub role_timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

/// One user action, immutable once built.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub prompt: String,
    pub role: AgentRole,
    pub working_dir: Option<PathBuf>,
    /// Overrides the configured deadline
    pub timeout: Option<Duration>,
}

impl TaskRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            role: AgentRole::default(),
            working_dir: None,
            timeout: None,
        }
    }

    pub fn role(mut self, role: AgentRole) -> Self {
        self.role = role;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Text written to the agent's stdin.
    pub fn agent_input(&self) -> String {
        self.role.compose_prompt(&self.prompt)
    }
}

/// Failure of a one-shot (non-streamed) agent call.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Extract(#[from] ExtractError),
}

impl PipelineError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            PipelineError::Supervisor(e) => e.exit_code(),
            PipelineError::Extract(_) => None,
        }
    }
}

pub struct EventSequencer {
    supervisor: Arc<ProcessSupervisor>,
    extractor: Arc<dyn PayloadExtractor>,
    settings: AgentSettings,
}

impl EventSequencer {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        extractor: Arc<dyn PayloadExtractor>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            supervisor,
            extractor,
            settings,
        }
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    fn invocation(&self, request: &TaskRequest, default_timeout: Duration) -> AgentInvocation {
        AgentInvocation::new(
            self.settings.command.clone(),
            self.settings.args.clone(),
            request.agent_input(),
            request.timeout.unwrap_or(default_timeout),
        )
        .working_dir(
            request
                .working_dir
                .clone()
                .or_else(|| self.settings.working_dir.clone()),
        )
    }

    /// Start a streamed session.
    ///
    /// The agent runs on a background task; dropping or cancelling the
    /// returned stream kills it.
    pub fn run(&self, request: TaskRequest) -> EventStream {
        let session_id = ulid::Ulid::new().to_string();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let span = info_span!("generation", session_id = %session_id, role = %request.role);
        let producer = Producer {
            supervisor: self.supervisor.clone(),
            extractor: self.extractor.clone(),
            invocation: self.invocation(&request, self.settings.stream_timeout),
            tracker: ProgressTracker::new(PIPELINE_TOTAL_STEPS),
            tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(producer.run().instrument(span));

        EventStream::new(session_id, rx, cancel)
    }

    /// Run one role to completion and return its parsed payload.
    pub async fn invoke(
        &self,
        request: TaskRequest,
        cancel: &CancellationToken,
    ) -> Result<Value, PipelineError> {
        let role = request.role;
        let invocation = self.invocation(&request, self.settings.role_timeout);
        let output = self
            .supervisor
            .invoke(invocation, cancel)
            .instrument(info_span!("agent_call", %role))
            .await?;
        let payload = self.extractor.extract(&output.combined())?;
        info!(%role, elapsed_ms = output.duration.as_millis() as u64, "agent call completed");
        Ok(payload)
    }
}

/// Non-decreasing progress over one session.
#[derive(Debug)]
pub struct ProgressTracker {
    total_steps: u32,
    percent: u8,
    current: Option<String>,
    completed: Vec<String>,
}

impl ProgressTracker {
    pub fn new(total_steps: u32) -> Self {
        Self {
            total_steps,
            percent: 0,
            current: None,
            completed: Vec::new(),
        }
    }

    pub fn current_step(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Enter `step`, never lowering the reported percent.
    pub fn advance(&mut self, step: &str, percent: u8) -> ProgressUpdate {
        if self.current.as_deref() != Some(step) {
            if let Some(previous) = self.current.take() {
                if !self.completed.contains(&previous) {
                    self.completed.push(previous);
                }
            }
            self.current = Some(step.to_string());
        }
        self.percent = self.percent.max(percent.min(COMPLETE_PERCENT));

        ProgressUpdate {
            step_name: step.to_string(),
            completed_steps: self.completed.clone(),
            total_steps: self.total_steps,
            percent: self.percent,
        }
    }

    /// Progress after the `n`th stdout chunk, held below completion.
    pub fn chunk(&mut self, n: u32) -> ProgressUpdate {
        let n = n.clamp(1, self.total_steps.max(1));
        let span = u32::from(CHUNK_CEILING_PERCENT - INPUT_SENT_PERCENT);
        let percent = u32::from(INPUT_SENT_PERCENT) + n * span / self.total_steps.max(1);
        let percent = percent.min(u32::from(CHUNK_CEILING_PERCENT)) as u8;
        self.advance(&format!("step_{n}"), percent)
    }

    pub fn complete(&mut self) -> ProgressUpdate {
        self.advance("complete", COMPLETE_PERCENT)
    }
}

struct Producer {
    supervisor: Arc<ProcessSupervisor>,
    extractor: Arc<dyn PayloadExtractor>,
    invocation: AgentInvocation,
    tracker: ProgressTracker,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

impl Producer {
    async fn run(mut self) {
        info!(command = %self.invocation.command, "generation session started");

        let starting = self.tracker.advance("starting", STARTING_PERCENT);
        if !self.emit(StreamEvent::Progress(starting)).await {
            return;
        }

        let mut handle = match self.supervisor.spawn(self.invocation.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(&e.to_string(), e.exit_code()).await;
                return;
            }
        };
        let pid = handle.pid();

        if let Err(e) = handle.send_input(&self.cancel).await {
            match e {
                SupervisorError::Cancelled => debug!(?pid, "session cancelled while sending input"),
                e => self.fail(&e.to_string(), e.exit_code()).await,
            }
            return;
        }

        let planned = self.tracker.advance("plan_architecture", INPUT_SENT_PERCENT);
        if !self.emit(StreamEvent::Progress(planned)).await {
            handle.kill().await;
            return;
        }

        let mut chunks = 0u32;
        let outcome = loop {
            match handle.next(&self.cancel).await {
                Some(ProcessEvent::Output {
                    stream: OutputStream::Stdout,
                    bytes,
                }) => {
                    chunks = chunks.saturating_add(1);
                    debug!(?pid, chunk = chunks, bytes, "agent output chunk");
                    let update = self.tracker.chunk(chunks);
                    if !self.offer(StreamEvent::Progress(update)) {
                        handle.kill().await;
                        return;
                    }
                }
                Some(ProcessEvent::Output { .. }) => {}
                Some(ProcessEvent::Finished(result)) => break result,
                None => {
                    break Err(SupervisorError::Io(
                        "agent process finished without an outcome".to_string(),
                    ))
                }
            }
        };

        let output = match outcome {
            Ok(output) => output,
            Err(SupervisorError::Cancelled) => {
                info!(?pid, "generation cancelled by client");
                return;
            }
            Err(e) => {
                self.fail(&e.to_string(), e.exit_code()).await;
                return;
            }
        };

        match self.extractor.extract(&output.combined()) {
            Ok(payload) => {
                let complete = self.tracker.complete();
                if self.emit(StreamEvent::Progress(complete)).await
                    && self.emit(StreamEvent::Result(payload)).await
                {
                    info!(
                        ?pid,
                        elapsed_ms = output.duration.as_millis() as u64,
                        "generation completed"
                    );
                }
            }
            Err(e) => {
                warn!(?pid, error = %e, stdout_bytes = output.stdout.len(), "agent output not usable");
                self.fail(&e.to_string(), None).await;
            }
        }
    }

    async fn fail(&mut self, message: &str, code: Option<i32>) {
        warn!(step = ?self.tracker.current_step(), ?code, "generation failed: {message}");
        let report = ErrorReport {
            message: message.to_string(),
            step: self.tracker.current_step().map(ToString::to_string),
            code,
        };
        self.emit(StreamEvent::Error(report)).await;
    }

    /// Deliver one event. `false` once the session was cancelled, the
    /// consumer went away or stopped reading for `DELIVERY_TIMEOUT`.
    async fn emit(&self, event: StreamEvent) -> bool {
        let kind = event.kind();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(kind, "session cancelled; event dropped");
                false
            }
            sent = self.tx.send(event) => {
                if sent.is_err() {
                    debug!(kind, "event consumer gone");
                    self.cancel.cancel();
                }
                sent.is_ok()
            }
            _ = tokio::time::sleep(DELIVERY_TIMEOUT) => {
                warn!(kind, timeout = ?DELIVERY_TIMEOUT, "event consumer stalled; abandoning session");
                self.cancel.cancel();
                false
            }
        }
    }

    /// Queue an output tick without waiting on the consumer, so a slow
    /// reader never holds up supervision of the agent. A full buffer drops
    /// the tick; later ticks carry a higher percent anyway.
    fn offer(&self, event: StreamEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                debug!(kind = event.kind(), "event consumer behind; progress tick dropped");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!("event consumer gone");
                self.cancel.cancel();
                false
            }
        }
    }
}

/// Consumer side of one session: forward-only, consumed once.
///
/// Yields nothing after a terminal event or after cancellation. Dropping it
/// cancels the session.
pub struct EventStream {
    session_id: String,
    rx: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    _guard: DropGuard,
    finished: bool,
}

impl EventStream {
    pub(crate) fn new(
        session_id: String,
        rx: mpsc::Receiver<StreamEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            rx,
            cancel: cancel.clone(),
            _guard: cancel.drop_guard(),
            finished: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Stop the session and kill the agent; no further events are yielded.
    pub fn cancel(&mut self) {
        self.finished = true;
        self.cancel.cancel();
        self.rx.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished || self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    self.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("session_id", &self.session_id)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_never_decreases() {
        let mut tracker = ProgressTracker::new(7);
        let mut last = 0;
        let mut percents = vec![
            tracker.advance("starting", STARTING_PERCENT).percent,
            tracker.advance("plan_architecture", INPUT_SENT_PERCENT).percent,
        ];
        for n in 1..=20 {
            percents.push(tracker.chunk(n).percent);
        }
        percents.push(tracker.advance("late", 1).percent);

        for percent in percents {
            assert!(percent >= last, "{percent} < {last}");
            assert!(percent < 100);
            last = percent;
        }
        assert_eq!(tracker.complete().percent, 100);
    }

    #[test]
    fn test_chunks_stay_below_completion() {
        let mut tracker = ProgressTracker::new(7);
        tracker.advance("plan_architecture", INPUT_SENT_PERCENT);
        let seventh = tracker.chunk(7);
        assert_eq!(seventh.percent, CHUNK_CEILING_PERCENT);
        assert_eq!(seventh.step_name, "step_7");
        assert_eq!(tracker.chunk(500).percent, CHUNK_CEILING_PERCENT);
    }

    #[test]
    fn test_completed_steps_accumulate_once() {
        let mut tracker = ProgressTracker::new(7);
        tracker.advance("starting", STARTING_PERCENT);
        tracker.advance("plan_architecture", INPUT_SENT_PERCENT);
        tracker.chunk(1);
        tracker.chunk(2);
        tracker.chunk(9);
        let update = tracker.chunk(12);

        assert_eq!(update.step_name, "step_7");
        assert_eq!(
            update.completed_steps,
            vec!["starting", "plan_architecture", "step_1", "step_2"]
        );
        assert_eq!(update.total_steps, 7);
    }

    #[test]
    fn test_agent_input_uses_role_directive() {
        let request = TaskRequest::new("Build a simple web app").role(AgentRole::CostAnalyst);
        assert!(request
            .agent_input()
            .starts_with("@04_cost_analyst\n\nBuild a simple web app"));
    }
}
