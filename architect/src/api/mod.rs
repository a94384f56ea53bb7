use std::{sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use shared_types::{
    AgentRole, AgentStatus, AgentTaskRequest, ApiResponse, GenerateRequest, SimulationRequest,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::ApiError,
    gate::client_id,
    sequencer::TaskRequest,
    supervisor::AgentInvocation,
    wire, AppState,
};

const STATUS_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on a serialized architecture or scenario document.
const MAX_DOCUMENT_BYTES: usize = 64 * 1024;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/api/architecture/generate", post(generate_architecture))
        .route("/api/agents/{role}", post(run_agent))
        .route("/api/simulation", post(run_simulation))
        .route("/api/agent/status", get(agent_status))
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /api/architecture/generate: stream a planner run as SSE frames.
pub async fn generate_architecture(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: GenerateRequest =
        serde_json::from_slice(&body).map_err(|_| ApiError::InvalidJson)?;
    let prompt = request
        .prompt
        .filter(|prompt| !prompt.trim().is_empty())
        .ok_or(ApiError::MissingDescription)?;

    let client = client_id(&headers);
    state.gate.throttle(&client).await?;
    let prompt = state.gate.screen(&prompt)?;

    let events = state.sequencer.run(TaskRequest::new(prompt));
    info!(session_id = %events.session_id(), %client, "generation stream opened");
    Ok(wire::stream_response(events))
}

/// POST /api/agents/{role}: one-shot call of a single agent role.
pub async fn run_agent(
    State(state): State<Arc<AppState>>,
    Path(role): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let role: AgentRole = role
        .parse()
        .map_err(|e: shared_types::UnknownRole| ApiError::BadRequest(e.to_string()))?;
    let request: AgentTaskRequest = if body.is_empty() {
        AgentTaskRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|_| ApiError::InvalidJson)?
    };

    state.gate.throttle(&client_id(&headers)).await?;

    let prompt = match (&request.architecture, request.prompt.as_deref()) {
        (Some(_), Some(_)) => {
            return Err(ApiError::BadRequest(
                "Send either a prompt or an architecture, not both".to_string(),
            ))
        }
        (Some(architecture), None) => {
            check_document_size("architecture", architecture)?;
            if let Some(scenario) = &request.scenario {
                check_document_size("scenario", scenario)?;
            }
            role.describe_architecture(architecture, request.scenario.as_ref())
        }
        (None, Some(prompt)) if !prompt.trim().is_empty() => state.gate.screen(prompt)?,
        _ => {
            return Err(ApiError::BadRequest(
                "A prompt or an architecture is required".to_string(),
            ))
        }
    };

    let cancel = CancellationToken::new();
    match state
        .sequencer
        .invoke(TaskRequest::new(prompt).role(role), &cancel)
        .await
    {
        Ok(payload) => Ok(Json(ApiResponse::ok(payload)).into_response()),
        Err(e) => {
            warn!(%role, exit_code = ?e.exit_code(), "agent call failed: {e}");
            Ok((
                StatusCode::BAD_GATEWAY,
                Json(ApiResponse::<Value>::err(e.to_string())),
            )
                .into_response())
        }
    }
}

/// POST /api/simulation: plan an architecture, then run the cost analyst on
/// it with the scenario's parameters. Responds with the analysis itself.
pub async fn run_simulation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: SimulationRequest =
        serde_json::from_slice(&body).map_err(|_| ApiError::InvalidJson)?;
    let (Some(scenario), Some(architecture_prompt)) = (
        request.scenario.filter(|scenario| !scenario.is_null()),
        request
            .architecture_prompt
            .filter(|prompt| !prompt.trim().is_empty()),
    ) else {
        return Err(ApiError::BadRequest(
            "Missing scenario or architecturePrompt".to_string(),
        ));
    };
    check_document_size("scenario", &scenario)?;

    state.gate.throttle(&client_id(&headers)).await?;
    let architecture_prompt = state.gate.screen(&architecture_prompt)?;

    let cancel = CancellationToken::new();
    let architecture = state
        .sequencer
        .invoke(TaskRequest::new(architecture_prompt), &cancel)
        .await
        .map_err(|e| {
            warn!(exit_code = ?e.exit_code(), "simulation planning failed: {e}");
            ApiError::AgentFailed(format!("Architecture planning failed: {e}"))
        })?;

    let role = AgentRole::CostAnalyst;
    let analysis_prompt = role.describe_architecture(&architecture, scenario.get("parameters"));
    let analysis = state
        .sequencer
        .invoke(TaskRequest::new(analysis_prompt).role(role), &cancel)
        .await
        .map_err(|e| {
            warn!(exit_code = ?e.exit_code(), "simulation cost analysis failed: {e}");
            ApiError::AgentFailed(format!("Cost analysis failed: {e}"))
        })?;

    info!("simulation completed");
    Ok(Json(analysis).into_response())
}

fn check_document_size(field: &str, document: &Value) -> Result<(), ApiError> {
    if document.to_string().len() > MAX_DOCUMENT_BYTES {
        return Err(ApiError::BadRequest(format!(
            "The {field} document exceeds {MAX_DOCUMENT_BYTES} bytes"
        )));
    }
    Ok(())
}

/// GET /api/agent/status: probe the agent binary with `--version`.
pub async fn agent_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let agent = state.agent();
    let probe = AgentInvocation::new(
        agent.command.clone(),
        vec!["--version".to_string()],
        "",
        STATUS_PROBE_TIMEOUT,
    )
    .working_dir(agent.working_dir.clone());

    let available = match state.supervisor.invoke(probe, &CancellationToken::new()).await {
        Ok(output) => {
            info!(command = %agent.command, version = %output.stdout.trim(), "agent available");
            true
        }
        Err(e) => {
            error!(command = %agent.command, "agent unavailable: {e}");
            false
        }
    };

    Json(AgentStatus {
        available,
        command: agent.command.clone(),
    })
}
