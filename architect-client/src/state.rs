use serde_json::Value;
use shared_types::{ProgressUpdate, StreamEvent};

/// Why a generation did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The agent pipeline reported a failure on the stream.
    #[error("{message}")]
    Agent {
        message: String,
        step: Option<String>,
        code: Option<i32>,
    },

    /// The server refused the request before streaming.
    #[error("{message}")]
    Rejected { status: u16, message: String },

    /// Network failure, or the stream ended without a terminal event.
    #[error("Connection to the generation service failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Generating,
    Succeeded,
    Failed,
}

/// Snapshot published to subscribers after every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationState {
    pub is_generating: bool,
    pub last_progress: Option<ProgressUpdate>,
    pub result: Option<Value>,
    pub error: Option<ClientError>,
    session: u64,
}

impl GenerationState {
    pub(crate) fn started(session: u64) -> Self {
        Self {
            is_generating: true,
            session,
            ..Self::default()
        }
    }

    /// Increments on every `start`.
    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn phase(&self) -> Phase {
        match (self.is_generating, &self.result, &self.error) {
            (true, _, _) => Phase::Generating,
            (false, Some(_), _) => Phase::Succeeded,
            (false, None, Some(_)) => Phase::Failed,
            (false, None, None) => Phase::Idle,
        }
    }

    /// Fold one stream event in. Returns `true` when the event settled the
    /// generation.
    pub(crate) fn apply(&mut self, event: StreamEvent) -> bool {
        match event {
            StreamEvent::Progress(update) => {
                self.last_progress = Some(update);
                false
            }
            StreamEvent::Result(payload) => {
                self.result = Some(payload);
                self.is_generating = false;
                true
            }
            StreamEvent::Error(report) => {
                self.error = Some(ClientError::Agent {
                    message: report.message,
                    step: report.step,
                    code: report.code,
                });
                self.is_generating = false;
                true
            }
        }
    }

    pub(crate) fn fail(&mut self, error: ClientError) {
        self.error = Some(error);
        self.is_generating = false;
    }
}
