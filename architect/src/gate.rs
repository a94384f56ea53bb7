//! Admission checks run before a generation is started
//!
//! Handlers only see the [`RequestGate`] trait, so the in-memory limiter can
//! be swapped for a shared store without touching the pipeline.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use axum::http::HeaderMap;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GateRejection {
    #[error("{0}")]
    InvalidPrompt(String),

    #[error("Rate limit exceeded. Maximum {max_requests} requests per {window_secs} seconds.")]
    RateLimited { max_requests: usize, window_secs: u64 },
}

#[async_trait]
pub trait RequestGate: Send + Sync {
    /// Count one request against `client_id`'s budget.
    async fn throttle(&self, client_id: &str) -> Result<(), GateRejection>;

    /// Validate a prompt and return its normalised form.
    fn screen(&self, prompt: &str) -> Result<String, GateRejection>;
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, client_id: &str) -> Result<(), GateRejection>;
}

/// Length and content rules for free-text prompts.
#[derive(Debug, Clone)]
pub struct PromptPolicy {
    max_chars: usize,
    unsafe_patterns: Vec<Regex>,
}

impl PromptPolicy {
    pub fn new(max_chars: usize) -> Result<Self, regex::Error> {
        let unsafe_patterns = [
            r"[;&|`$(){}\[\]]",
            r"(?i)\b(rm|del|format|shutdown|reboot)\b",
            r"(?i)\b(sudo|su|chmod|chown)\b",
            r"[<>]",
        ]
        .into_iter()
        .map(Regex::new)
        .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            max_chars,
            unsafe_patterns,
        })
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn validate(&self, prompt: &str) -> Result<(), GateRejection> {
        if prompt.trim().is_empty() {
            return Err(GateRejection::InvalidPrompt(
                "Prompt cannot be empty".to_string(),
            ));
        }
        if prompt.chars().count() > self.max_chars {
            return Err(GateRejection::InvalidPrompt(format!(
                "Prompt exceeds maximum length of {} characters",
                self.max_chars
            )));
        }
        if self.unsafe_patterns.iter().any(|p| p.is_match(prompt)) {
            return Err(GateRejection::InvalidPrompt(
                "Prompt contains potentially unsafe characters or commands".to_string(),
            ));
        }
        Ok(())
    }

    /// Trim, collapse runs of whitespace and cap the length.
    pub fn sanitize(&self, prompt: &str) -> String {
        prompt
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(self.max_chars)
            .collect()
    }
}

/// Rolling-window request counter keyed by client id.
#[derive(Debug)]
pub struct InMemoryRateLimiter {
    max_requests: usize,
    window: Duration,
    hits: Mutex<HashMap<String, Vec<Instant>>>,
}

impl InMemoryRateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn check(&self, client_id: &str) -> Result<(), GateRejection> {
        let now = Instant::now();
        let mut hits = self.hits.lock().await;

        hits.retain(|_, stamps| {
            stamps.retain(|at| now.duration_since(*at) < self.window);
            !stamps.is_empty()
        });

        let stamps = hits.entry(client_id.to_string()).or_default();
        if stamps.len() >= self.max_requests {
            warn!(client_id, max_requests = self.max_requests, "rate limit exceeded");
            return Err(GateRejection::RateLimited {
                max_requests: self.max_requests,
                window_secs: self.window.as_secs(),
            });
        }
        stamps.push(now);
        debug!(client_id, used = stamps.len(), "request admitted");
        Ok(())
    }
}

/// Prompt policy plus a rate limiter.
pub struct StandardGate {
    policy: PromptPolicy,
    limiter: Box<dyn RateLimiter>,
}

impl StandardGate {
    pub fn new(policy: PromptPolicy, limiter: impl RateLimiter + 'static) -> Self {
        Self {
            policy,
            limiter: Box::new(limiter),
        }
    }
}

#[async_trait]
impl RequestGate for StandardGate {
    async fn throttle(&self, client_id: &str) -> Result<(), GateRejection> {
        self.limiter.check(client_id).await
    }

    fn screen(&self, prompt: &str) -> Result<String, GateRejection> {
        self.policy.validate(prompt)?;
        Ok(self.policy.sanitize(prompt))
    }
}

/// Admits everything unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenGate;

#[async_trait]
impl RequestGate for OpenGate {
    async fn throttle(&self, _client_id: &str) -> Result<(), GateRejection> {
        Ok(())
    }

    fn screen(&self, prompt: &str) -> Result<String, GateRejection> {
        Ok(prompt.to_string())
    }
}

/// First `x-forwarded-for` hop, or `unknown`.
pub fn client_id(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or("unknown")
        .to_string()
}
