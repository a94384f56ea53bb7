//! End-to-end tests: a real gateway on a loopback port, mock agents written
//! as shell scripts, and the consumer reading the live stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use architect::extract::BraceMatchingExtractor;
use architect::gate::OpenGate;
use architect::sequencer::AgentSettings;
use architect::supervisor::ProcessSupervisor;
use architect::AppState;
use architect_client::{ClientError, GenerationState, Phase, StreamConsumer};
use axum::body::Body;
use axum::routing::post;
use axum::Router;
use futures_util::{stream, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

struct Gateway {
    base_url: String,
    dir: tempfile::TempDir,
}

impl Gateway {
    async fn start(agent_script: &str) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp directory");
        let script = dir.path().join("agent.sh");
        std::fs::write(&script, agent_script).expect("Failed to write mock agent");

        let state = Arc::new(AppState::new(
            ProcessSupervisor::new(vec!["/bin/sh".to_string()]),
            Arc::new(BraceMatchingExtractor),
            Arc::new(OpenGate),
            AgentSettings {
                command: "/bin/sh".to_string(),
                args: vec![script.to_string_lossy().to_string()],
                stream_timeout: Duration::from_secs(30),
                role_timeout: Duration::from_secs(30),
                working_dir: Some(dir.path().to_path_buf()),
            },
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, architect::app(state)).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            dir,
        }
    }

    async fn agent_pid(&self, name: &str) -> u32 {
        let path = self.dir.path().join(name);
        let started = Instant::now();
        loop {
            if let Ok(raw) = std::fs::read_to_string(&path) {
                if let Ok(pid) = raw.trim().parse() {
                    return pid;
                }
            }
            assert!(started.elapsed() < Duration::from_secs(5), "agent never wrote {name}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

const PROGRESS_FRAME: &str = "data: {\"type\":\"progress\",\"data\":{\"currentStep\":\"plan_architecture\",\"completedSteps\":[\"starting\"],\"totalSteps\":7,\"progress\":14}}\n\n";

/// Serve `body()` as the generation endpoint, bypassing the gateway, so
/// tests control the exact bytes and when the connection ends.
async fn raw_server(body: fn() -> Body) -> String {
    let app = Router::new().route(
        "/api/architecture/generate",
        post(move || async move { body() }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn settle(consumer: &StreamConsumer) -> GenerationState {
    tokio::time::timeout(SETTLE_TIMEOUT, consumer.wait_settled())
        .await
        .expect("generation never settled")
}

/// Wait until the agent has produced output for the current session.
async fn wait_for_output(consumer: &StreamConsumer) {
    let mut rx = consumer.subscribe();
    tokio::time::timeout(
        SETTLE_TIMEOUT,
        rx.wait_for(|state| {
            state
                .last_progress
                .as_ref()
                .is_some_and(|p| p.step_name.starts_with("step_"))
        }),
    )
    .await
    .expect("no output progress")
    .expect("state channel closed");
}

fn process_exists(pid: u32) -> bool {
    std::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "pid="])
        .output()
        .map(|out| out.status.success() && !String::from_utf8_lossy(&out.stdout).trim().is_empty())
        .unwrap_or(false)
}

async fn wait_for_exit(pid: u32, within: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < within {
        if !process_exists(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_successful_generation_settles_with_result() {
    let gateway = Gateway::start(
        "cat >/dev/null\nprintf 'banner text {\"architecture_name\":\"X\",\"services\":[]} trailer'\n",
    )
    .await;
    let consumer = StreamConsumer::new(&gateway.base_url);

    let mut rx = consumer.subscribe();
    let observed = tokio::spawn(async move {
        let mut percents = Vec::new();
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().clone();
            if let Some(progress) = &state.last_progress {
                percents.push(progress.percent);
            }
            if !state.is_generating {
                break;
            }
        }
        percents
    });

    let session = consumer.start("Build a simple web app");
    let state = settle(&consumer).await;

    assert_eq!(state.session(), session);
    assert_eq!(state.phase(), Phase::Succeeded);
    assert_eq!(
        state.result,
        Some(json!({"architecture_name": "X", "services": []}))
    );
    assert!(state.error.is_none());
    assert_eq!(state.last_progress.map(|p| p.percent), Some(100));

    let percents = observed.await.unwrap();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
}

#[tokio::test]
async fn test_agent_failure_settles_with_agent_error() {
    let gateway = Gateway::start("cat >/dev/null\necho 'no credits left' >&2\nexit 2\n").await;
    let consumer = StreamConsumer::new(&gateway.base_url);

    consumer.start("Build a simple web app");
    let state = settle(&consumer).await;

    assert_eq!(state.phase(), Phase::Failed);
    match state.error {
        Some(ClientError::Agent { message, code, .. }) => {
            assert_eq!(code, Some(2));
            assert!(message.contains("no credits left"));
        }
        other => panic!("expected agent error, got {other:?}"),
    }
    assert!(state.result.is_none());
}

#[tokio::test]
async fn test_empty_prompt_is_rejected() {
    let gateway = Gateway::start("touch spawned\n").await;
    let consumer = StreamConsumer::new(&gateway.base_url);

    consumer.start("   ");
    let state = settle(&consumer).await;

    assert_eq!(
        state.error,
        Some(ClientError::Rejected {
            status: 400,
            message: "Description is required".to_string()
        })
    );
    assert!(!gateway.dir.path().join("spawned").exists());
}

#[tokio::test]
async fn test_cancel_is_silent_and_kills_agent() {
    let gateway =
        Gateway::start("echo $$ > pid\nwhile true; do echo tick; sleep 0.2; done\n").await;
    let consumer = StreamConsumer::new(&gateway.base_url);

    consumer.start("Build a simple web app");
    wait_for_output(&consumer).await;
    let pid = gateway.agent_pid("pid").await;

    consumer.cancel();
    let state = consumer.state();
    assert_eq!(state.phase(), Phase::Idle);
    assert!(state.error.is_none());
    assert!(state.result.is_none());

    assert!(
        wait_for_exit(pid, Duration::from_secs(5)).await,
        "agent {pid} still running after cancel"
    );

    // No late frame may resurrect the cancelled session.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(consumer.state(), state);

    consumer.cancel();
    assert_eq!(consumer.state(), state);
}

#[tokio::test]
async fn test_restart_supersedes_in_flight_generation() {
    let gateway = Gateway::start(
        "input=$(cat)\ncase \"$input\" in\n  *slow*) echo $$ > slow.pid; while true; do echo tick; sleep 0.2; done ;;\n  *) echo '{\"architecture_name\":\"fast\"}' ;;\nesac\n",
    )
    .await;
    let consumer = StreamConsumer::new(&gateway.base_url);

    let first = consumer.start("slow please");
    wait_for_output(&consumer).await;
    let slow_pid = gateway.agent_pid("slow.pid").await;

    let second = consumer.start("fast please");
    assert_eq!(second, first + 1);

    let state = settle(&consumer).await;
    assert_eq!(state.session(), second);
    assert_eq!(state.result, Some(json!({"architecture_name": "fast"})));
    assert!(state.error.is_none());

    assert!(
        wait_for_exit(slow_pid, Duration::from_secs(5)).await,
        "superseded agent {slow_pid} still running"
    );
}

#[tokio::test]
async fn test_unreachable_server_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let consumer = StreamConsumer::new(format!("http://{addr}"));
    consumer.start("Build a simple web app");
    let state = settle(&consumer).await;

    assert_eq!(state.phase(), Phase::Failed);
    assert!(matches!(state.error, Some(ClientError::Transport(_))));
}

#[tokio::test]
async fn test_connection_dropped_mid_stream_is_transport_error() {
    let base_url = raw_server(|| {
        let frames = stream::once(async { Ok::<_, std::io::Error>(PROGRESS_FRAME) }).chain(
            stream::once(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Err(std::io::Error::other("agent host went away"))
            }),
        );
        Body::from_stream(frames)
    })
    .await;
    let consumer = StreamConsumer::new(&base_url);

    consumer.start("Build a simple web app");
    let state = settle(&consumer).await;

    assert_eq!(state.phase(), Phase::Failed);
    assert!(matches!(state.error, Some(ClientError::Transport(_))), "{:?}", state.error);
    assert_eq!(state.last_progress.map(|p| p.percent), Some(14));
    assert!(state.result.is_none());
}

#[tokio::test]
async fn test_clean_close_without_terminal_event_is_transport_error() {
    let base_url = raw_server(|| Body::from(PROGRESS_FRAME)).await;
    let consumer = StreamConsumer::new(&base_url);

    consumer.start("Build a simple web app");
    let state = settle(&consumer).await;

    assert_eq!(state.phase(), Phase::Failed);
    assert!(matches!(state.error, Some(ClientError::Transport(_))), "{:?}", state.error);
    assert_eq!(state.last_progress.map(|p| p.percent), Some(14));
}

#[tokio::test]
async fn test_malformed_frame_is_skipped_and_result_still_settles() {
    let base_url = raw_server(|| {
        Body::from(format!(
            "{PROGRESS_FRAME}data: {{not json\n\ndata: {}\n\ndata: [DONE]\n\n",
            r#"{"type":"result","data":{"architecture_name":"X"}}"#
        ))
    })
    .await;
    let consumer = StreamConsumer::new(&base_url);

    consumer.start("Build a simple web app");
    let state = settle(&consumer).await;

    assert_eq!(state.phase(), Phase::Succeeded);
    assert_eq!(state.result, Some(json!({"architecture_name": "X"})));
    assert!(state.error.is_none());
    assert_eq!(state.last_progress.map(|p| p.percent), Some(14));
}
