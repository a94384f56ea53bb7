//! Shared types between the generation server and its clients
//!
//! These types are used by:
//! - the `architect` server (event production and framing)
//! - the `architect-client` stream consumer (frame decoding)
//! - the browser dashboard (TypeScript bindings exported with ts-rs)
//!
//! Serializable with serde for JSON over HTTP

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ============================================================================
// Wire Protocol
// ============================================================================

/// Prefix of every frame line on the generation stream.
pub const FRAME_DATA_PREFIX: &str = "data: ";

/// Payload of the final frame, sent once after the terminal event.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Total number of stages the agent pipeline reports against.
pub const PIPELINE_TOTAL_STEPS: u32 = 7;

/// Progress snapshot for a running generation.
///
/// Field names on the wire follow the dashboard's existing contract
/// (`currentStep`, `completedSteps`, `totalSteps`, `progress`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../dashboard/src/types/generated.ts")]
pub struct ProgressUpdate {
    #[serde(rename = "currentStep")]
    pub step_name: String,
    pub completed_steps: Vec<String>,
    pub total_steps: u32,
    /// 0..=100, non-decreasing within one session
    #[serde(rename = "progress")]
    pub percent: u8,
}

/// Terminal failure reported on the stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export, export_to = "../../dashboard/src/types/generated.ts")]
pub struct ErrorReport {
    pub message: String,
    /// Pipeline step that was running when the failure happened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    /// Agent process exit code, when one is known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

impl ErrorReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            step: None,
            code: None,
        }
    }
}

/// One event of a generation stream.
///
/// Serialized as `{"type":"progress"|"result"|"error","data":...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
#[ts(export, export_to = "../../dashboard/src/types/generated.ts")]
pub enum StreamEvent {
    Progress(ProgressUpdate),
    /// Architecture document produced by the agent; opaque to the pipeline
    Result(serde_json::Value),
    Error(ErrorReport),
}

impl StreamEvent {
    /// `Result` and `Error` end a session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Result(_) | StreamEvent::Error(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Progress(_) => "progress",
            StreamEvent::Result(_) => "result",
            StreamEvent::Error(_) => "error",
        }
    }

    /// Render the event as one self-delimited frame: `data: <json>\n\n`.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{FRAME_DATA_PREFIX}{json}\n\n"))
    }
}

/// Final frame of every completed stream.
pub fn done_frame() -> String {
    format!("{FRAME_DATA_PREFIX}{DONE_SENTINEL}\n\n")
}

// ============================================================================
// Request Types
// ============================================================================

/// Body of `POST /api/architecture/generate`.
///
/// `description` is accepted as an alias for older dashboard builds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export, export_to = "../../dashboard/src/types/generated.ts")]
pub struct GenerateRequest {
    #[serde(default, alias = "description", skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
        }
    }
}

/// Body of `POST /api/agents/{role}`.
///
/// Exactly one of `prompt` or `architecture` is expected. A free prompt goes
/// through the prompt policy; an architecture document is only bounded in
/// size, since it is structured data rather than user text.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../dashboard/src/types/generated.ts")]
pub struct AgentTaskRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub architecture: Option<serde_json::Value>,
    /// What-if parameters, only used by the cost analyst
    #[serde(default)]
    pub scenario: Option<serde_json::Value>,
}

/// Body of `POST /api/simulation`: plan an architecture, then price it under
/// the scenario's `parameters`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../dashboard/src/types/generated.ts")]
pub struct SimulationRequest {
    #[serde(default)]
    pub scenario: Option<serde_json::Value>,
    #[serde(default)]
    pub architecture_prompt: Option<String>,
}

/// Availability of the agent binary, from `GET /api/agent/status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export, export_to = "../../dashboard/src/types/generated.ts")]
pub struct AgentStatus {
    pub available: bool,
    pub command: String,
}

// ============================================================================
// Agent Roles
// ============================================================================

/// Agent personas the external agent can assume.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "../../dashboard/src/types/generated.ts")]
pub enum AgentRole {
    #[default]
    ArchitecturePlanner,
    DiagramGenerator,
    TerraformEngineer,
    CostAnalyst,
    SecurityAuditor,
    ArchitectureExplainer,
    UiLayoutDesigner,
}

impl AgentRole {
    pub const ALL: [AgentRole; 7] = [
        AgentRole::ArchitecturePlanner,
        AgentRole::DiagramGenerator,
        AgentRole::TerraformEngineer,
        AgentRole::CostAnalyst,
        AgentRole::SecurityAuditor,
        AgentRole::ArchitectureExplainer,
        AgentRole::UiLayoutDesigner,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::ArchitecturePlanner => "architecture_planner",
            AgentRole::DiagramGenerator => "diagram_generator",
            AgentRole::TerraformEngineer => "terraform_engineer",
            AgentRole::CostAnalyst => "cost_analyst",
            AgentRole::SecurityAuditor => "security_auditor",
            AgentRole::ArchitectureExplainer => "architecture_explainer",
            AgentRole::UiLayoutDesigner => "ui_layout_designer",
        }
    }

    /// Name the agent resolves after the `@` directive.
    pub fn directive(self) -> &'static str {
        match self {
            AgentRole::ArchitecturePlanner => "01_architecture_planner",
            AgentRole::DiagramGenerator => "02_diagram_generator",
            AgentRole::TerraformEngineer => "03_terraform_engineer",
            AgentRole::CostAnalyst => "04_cost_analyst",
            AgentRole::SecurityAuditor => "05_security_auditor",
            AgentRole::ArchitectureExplainer => "06_architecture_explainer",
            AgentRole::UiLayoutDesigner => "07_ui_layout_designer",
        }
    }

    fn lead(self) -> &'static str {
        match self {
            AgentRole::ArchitecturePlanner => "Plan an architecture for:",
            AgentRole::DiagramGenerator => "Generate diagram layout for this architecture:",
            AgentRole::TerraformEngineer => "Generate Terraform code for this architecture:",
            AgentRole::CostAnalyst => "Analyze costs for this architecture:",
            AgentRole::SecurityAuditor => "Perform security audit for this architecture:",
            AgentRole::ArchitectureExplainer => "Generate documentation for this architecture:",
            AgentRole::UiLayoutDesigner => "Design UI layout for these requirements:",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            AgentRole::ArchitecturePlanner => {
                "Please provide the response in the exact JSON format specified in your prompt."
            }
            _ => "Please provide the response in JSON format.",
        }
    }

    /// Full input written to the agent's stdin for this role.
    pub fn compose_prompt(self, body: &str) -> String {
        format!("@{}\n\n{}\n\n{}", self.directive(), body, self.suffix())
    }

    /// Prompt body describing an architecture document (and, for the cost
    /// analyst, an optional what-if scenario).
    pub fn describe_architecture(
        self,
        architecture: &serde_json::Value,
        scenario: Option<&serde_json::Value>,
    ) -> String {
        let pretty = |value: &serde_json::Value| {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        };
        let mut body = format!("{}\n{}", self.lead(), pretty(architecture));
        if let (AgentRole::CostAnalyst, Some(scenario)) = (self, scenario) {
            body.push_str("\n\nScenario parameters:\n");
            body.push_str(&pretty(scenario));
        }
        body
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRole(pub String);

impl fmt::Display for UnknownRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown agent role '{}'", self.0)
    }
}

impl std::error::Error for UnknownRole {}

impl FromStr for AgentRole {
    type Err = UnknownRole;

    /// Accepts either the role name (`cost_analyst`) or its directive
    /// (`04_cost_analyst`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        AgentRole::ALL
            .into_iter()
            .find(|role| role.as_str() == s || role.directive() == s)
            .ok_or_else(|| UnknownRole(s.to_string()))
    }
}

// ============================================================================
// API Types
// ============================================================================

/// Generic API response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
