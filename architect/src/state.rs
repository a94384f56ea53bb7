use std::sync::Arc;

use crate::{
    config::Config,
    extract::{BraceMatchingExtractor, PayloadExtractor},
    gate::{InMemoryRateLimiter, PromptPolicy, RequestGate, StandardGate},
    sequencer::{AgentSettings, EventSequencer},
    supervisor::ProcessSupervisor,
};

pub struct AppState {
    pub supervisor: Arc<ProcessSupervisor>,
    pub sequencer: EventSequencer,
    pub gate: Arc<dyn RequestGate>,
}

impl AppState {
    pub fn new(
        supervisor: ProcessSupervisor,
        extractor: Arc<dyn PayloadExtractor>,
        gate: Arc<dyn RequestGate>,
        agent: AgentSettings,
    ) -> Self {
        let supervisor = Arc::new(supervisor);
        Self {
            sequencer: EventSequencer::new(supervisor.clone(), extractor, agent),
            supervisor,
            gate,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let policy = PromptPolicy::new(config.prompt_max_chars)?;
        let limiter =
            InMemoryRateLimiter::new(config.rate_limit_max_requests, config.rate_limit_window);

        Ok(Self::new(
            ProcessSupervisor::new(config.allowed_commands.clone()),
            Arc::new(BraceMatchingExtractor),
            Arc::new(StandardGate::new(policy, limiter)),
            config.agent_settings(),
        ))
    }

    pub fn agent(&self) -> &AgentSettings {
        self.sequencer.settings()
    }
}
