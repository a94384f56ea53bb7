use std::path::PathBuf;
use std::time::Duration;

use crate::sequencer::AgentSettings;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the gateway listens on
    pub port: u16,
    /// Agent binary launched for every generation
    pub agent_command: String,
    /// Arguments passed to the agent binary
    pub agent_args: Vec<String>,
    /// Commands the process supervisor is allowed to launch.
    pub allowed_commands: Vec<String>,
    /// Deadline for a streamed generation
    pub agent_timeout: Duration,
    /// Deadline for a single-role agent call
    pub role_timeout: Duration,
    /// Working directory for agent processes (gateway cwd when unset)
    pub agent_working_dir: Option<PathBuf>,
    /// Maximum accepted prompt length, in characters
    pub prompt_max_chars: usize,
    /// Per-client request budget over a rolling window.
    pub rate_limit_max_requests: usize,
    pub rate_limit_window: Duration,
    /// Browser origins allowed to call the API
    pub cors_allowed_origins: Vec<String>,
    /// Built dashboard assets served on unmatched paths
    pub frontend_dist: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            port: env_parse("ARCHITECT_PORT", 3000)?,
            agent_command: env_str("AGENT_COMMAND", "kiro-cli"),
            agent_args: env_args("AGENT_ARGS", &["chat"]),
            allowed_commands: env_csv("AGENT_ALLOWED_COMMANDS", &["kiro-cli", "terraform", "aws"]),
            agent_timeout: Duration::from_secs(env_parse("AGENT_TIMEOUT_SECS", 120)?),
            role_timeout: Duration::from_secs(env_parse("AGENT_ROLE_TIMEOUT_SECS", 60)?),
            agent_working_dir: std::env::var("AGENT_WORKING_DIR").ok().map(PathBuf::from),
            prompt_max_chars: env_parse("PROMPT_MAX_CHARS", 5000)?,
            rate_limit_max_requests: env_parse("RATE_LIMIT_MAX_REQUESTS", 10)?,
            rate_limit_window: Duration::from_secs(env_parse("RATE_LIMIT_WINDOW_SECS", 60)?),
            cors_allowed_origins: env_csv(
                "CORS_ALLOWED_ORIGINS",
                &["http://localhost:3000", "http://127.0.0.1:3000"],
            ),
            frontend_dist: frontend_dist_from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the supervisor would refuse at request time.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self
            .allowed_commands
            .iter()
            .any(|allowed| allowed == &self.agent_command)
        {
            return Err(anyhow::anyhow!(
                "AGENT_COMMAND '{}' is not in AGENT_ALLOWED_COMMANDS ({})",
                self.agent_command,
                self.allowed_commands.join(", ")
            ));
        }
        if self.rate_limit_max_requests == 0 {
            return Err(anyhow::anyhow!("RATE_LIMIT_MAX_REQUESTS must be at least 1"));
        }
        Ok(())
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            command: self.agent_command.clone(),
            args: self.agent_args.clone(),
            stream_timeout: self.agent_timeout,
            role_timeout: self.role_timeout,
            working_dir: self.agent_working_dir.clone(),
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_csv(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}

fn env_args(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw.split_whitespace().map(ToString::to_string).collect(),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}

/// Resolve the dashboard dist directory.
///
/// If `FRONTEND_DIST` is set, that value is used as-is.
/// Otherwise resolve from the workspace root so this works whether the
/// gateway is launched from the repository root or from `architect/`.
pub fn frontend_dist_from_env() -> String {
    if let Ok(path) = std::env::var("FRONTEND_DIST") {
        return path;
    }

    let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    workspace_root
        .join("dashboard/dist")
        .to_string_lossy()
        .to_string()
}
