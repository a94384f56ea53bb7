//! Shared fixtures: mock agents are POSIX shell scripts run through
//! `/bin/sh` inside a temp directory, which is also their working directory.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use shared_types::{StreamEvent, DONE_SENTINEL, FRAME_DATA_PREFIX};

use architect::extract::BraceMatchingExtractor;
use architect::gate::{OpenGate, RequestGate};
use architect::sequencer::{AgentSettings, EventSequencer};
use architect::supervisor::ProcessSupervisor;
use architect::AppState;

pub const SH: &str = "/bin/sh";

pub struct MockAgent {
    pub dir: tempfile::TempDir,
    pub script: PathBuf,
}

impl MockAgent {
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp directory");
        let script = dir.path().join("agent.sh");
        std::fs::write(&script, body).expect("Failed to write mock agent");
        Self { dir, script }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn settings(&self, stream_timeout: Duration) -> AgentSettings {
        AgentSettings {
            command: SH.to_string(),
            args: vec![self.script.to_string_lossy().to_string()],
            stream_timeout,
            role_timeout: stream_timeout,
            working_dir: Some(self.dir.path().to_path_buf()),
        }
    }

    pub fn sequencer(&self, stream_timeout: Duration) -> EventSequencer {
        EventSequencer::new(
            Arc::new(supervisor()),
            Arc::new(BraceMatchingExtractor),
            self.settings(stream_timeout),
        )
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state_with_gate(Arc::new(OpenGate))
    }

    pub fn state_with_gate(&self, gate: Arc<dyn RequestGate>) -> Arc<AppState> {
        Arc::new(AppState::new(
            supervisor(),
            Arc::new(BraceMatchingExtractor),
            gate,
            self.settings(Duration::from_secs(10)),
        ))
    }

    pub fn app(&self) -> axum::Router {
        architect::app(self.state())
    }
}

pub fn supervisor() -> ProcessSupervisor {
    ProcessSupervisor::new(vec![SH.to_string()])
}

pub fn generate_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/architecture/generate")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("Body is not UTF-8")
}

/// Payloads of every `data:` frame, in order, `[DONE]` included.
pub fn frame_payloads(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter(|frame| !frame.is_empty() && !frame.starts_with(':'))
        .map(|frame| {
            frame
                .strip_prefix(FRAME_DATA_PREFIX)
                .unwrap_or_else(|| panic!("frame without data prefix: {frame:?}"))
                .to_string()
        })
        .collect()
}

/// Split frames into events and assert the stream is closed by `[DONE]`.
pub fn events_then_done(body: &str) -> Vec<StreamEvent> {
    let mut payloads = frame_payloads(body);
    assert_eq!(
        payloads.pop().as_deref(),
        Some(DONE_SENTINEL),
        "stream must end with the sentinel: {body}"
    );
    payloads
        .iter()
        .map(|payload| serde_json::from_str(payload).expect("frame is not a stream event"))
        .collect()
}

pub fn percents(events: &[StreamEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Progress(update) => Some(update.percent),
            _ => None,
        })
        .collect()
}

pub fn assert_non_decreasing(values: &[u8]) {
    for pair in values.windows(2) {
        assert!(pair[0] <= pair[1], "progress went backwards: {values:?}");
    }
}

#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    let output = std::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "pid="])
        .output();

    match output {
        Ok(output) => {
            output.status.success() && !String::from_utf8_lossy(&output.stdout).trim().is_empty()
        }
        Err(_) => false,
    }
}

/// Poll until `path` holds a pid.
pub async fn wait_for_pid(path: &Path, within: Duration) -> u32 {
    let started = Instant::now();
    loop {
        if let Ok(raw) = std::fs::read_to_string(path) {
            if let Ok(pid) = raw.trim().parse() {
                return pid;
            }
        }
        assert!(started.elapsed() < within, "no pid written to {}", path.display());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until the process is gone.
#[cfg(unix)]
pub async fn wait_for_exit(pid: u32, within: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < within {
        if !process_exists(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    !process_exists(pid)
}
