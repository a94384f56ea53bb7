//! Client side of the generation stream
//!
//! One [`StreamConsumer`] runs at most one generation at a time. Every
//! `start` opens a new session; updates tagged with an older session are
//! discarded, so a superseded or cancelled stream can never overwrite the
//! state of the current one.

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use shared_types::GenerateRequest;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::decoder::{DecodeError, Frame, FrameDecoder};
use crate::state::{ClientError, GenerationState};

const GENERATE_PATH: &str = "/api/architecture/generate";

struct ActiveGeneration {
    session: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct StreamConsumer {
    http: reqwest::Client,
    endpoint: String,
    state: Arc<watch::Sender<GenerationState>>,
    active: Mutex<Option<ActiveGeneration>>,
}

impl StreamConsumer {
    pub fn new(base_url: impl AsRef<str>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: impl AsRef<str>) -> Self {
        let (state, _) = watch::channel(GenerationState::default());
        Self {
            http,
            endpoint: format!("{}{GENERATE_PATH}", base_url.as_ref().trim_end_matches('/')),
            state: Arc::new(state),
            active: Mutex::new(None),
        }
    }

    /// Begin a generation, cancelling any in-flight one first.
    ///
    /// The state is reset before the request is sent. Must be called from
    /// within a Tokio runtime. Returns the new session number.
    pub fn start(&self, prompt: impl Into<String>) -> u64 {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = active.take() {
            debug!(session = previous.session, "superseding in-flight generation");
            previous.stop();
        }

        let session = self.state.borrow().session() + 1;
        self.state.send_replace(GenerationState::started(session));

        let cancel = CancellationToken::new();
        let run = Session {
            http: self.http.clone(),
            endpoint: self.endpoint.clone(),
            prompt: prompt.into(),
            session,
            state: self.state.clone(),
        };
        let task = tokio::spawn(
            run.drive(cancel.clone())
                .instrument(info_span!("stream_consumer", session)),
        );

        *active = Some(ActiveGeneration {
            session,
            cancel,
            task,
        });
        session
    }

    /// Abort the in-flight generation, if any. Leaves no error behind.
    pub fn cancel(&self) {
        let Some(active) = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let session = active.session;
        active.stop();
        let cancelled = self.state.send_if_modified(|state| {
            if state.session() != session || !state.is_generating {
                return false;
            }
            state.is_generating = false;
            true
        });
        if cancelled {
            info!(session, "generation cancelled");
        }
    }

    pub fn state(&self) -> GenerationState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GenerationState> {
        self.state.subscribe()
    }

    /// Wait until the current generation is no longer running.
    pub async fn wait_settled(&self) -> GenerationState {
        let mut rx = self.state.subscribe();
        let settled = rx.wait_for(|state| !state.is_generating).await;
        match settled {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        let active = self
            .active
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(active) = active {
            active.stop();
        }
    }
}

impl ActiveGeneration {
    fn stop(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

struct Session {
    http: reqwest::Client,
    endpoint: String,
    prompt: String,
    session: u64,
    state: Arc<watch::Sender<GenerationState>>,
}

impl Session {
    async fn drive(self, cancel: CancellationToken) {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            outcome = self.stream() => outcome,
        };

        if let Err(error) = outcome {
            warn!(error = %error, "generation failed");
            self.update(|state| {
                state.fail(error);
            });
        }
    }

    async fn stream(&self) -> Result<(), ClientError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&GenerateRequest::new(self.prompt.clone()))
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| body.get("error")?.as_str().map(ToString::to_string))
                .unwrap_or_else(|| status.to_string());
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let mut decoder = FrameDecoder::new();
        let mut settled = false;
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) if settled => {
                    debug!(error = %e, "transport closed after terminal frame");
                    return Ok(());
                }
                Err(e) => return Err(ClientError::Transport(e.to_string())),
            };

            for frame in decoder.push(&chunk) {
                if self.handle(frame, &mut settled) {
                    return Ok(());
                }
            }
        }

        if let Some(frame) = decoder.finish() {
            self.handle(frame, &mut settled);
        }
        if settled {
            Ok(())
        } else {
            Err(ClientError::Transport(
                "stream ended before a terminal event".to_string(),
            ))
        }
    }

    /// Apply one decoded frame. Returns `true` on the end-of-stream sentinel
    /// after a terminal event.
    fn handle(&self, frame: Result<Frame, DecodeError>, settled: &mut bool) -> bool {
        match frame {
            Ok(Frame::Event(event)) if *settled => {
                warn!(kind = event.kind(), "ignoring event after terminal frame");
                false
            }
            Ok(Frame::Event(event)) => {
                debug!(kind = event.kind(), "stream event");
                let mut terminal = false;
                self.update(|state| terminal = state.apply(event));
                *settled = terminal;
                false
            }
            Ok(Frame::Done) => *settled,
            Err(e) => {
                warn!("skipping malformed frame: {e}");
                false
            }
        }
    }

    /// Mutate the published state if this session is still current.
    fn update(&self, mutate: impl FnOnce(&mut GenerationState)) {
        self.state.send_if_modified(|state| {
            if state.session() != self.session || !state.is_generating {
                return false;
            }
            mutate(state);
            true
        });
    }
}
