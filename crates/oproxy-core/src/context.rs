use std::time::Duration;

use tokio::time::Instant;

use oproxy_provider::Outcome;

/// Per-call transient state threaded through the dispatch pipeline.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub endpoint: &'static str,
    pub alias: String,
    pub client_key_id: Option<i64>,
    pub client_ip: Option<String>,
    pub deadline: Instant,
    pub attempt: u32,
    /// One entry per attempted candidate, in order, for audit/telemetry.
    pub outcomes: Vec<AttemptRecord>,
}

impl RequestContext {
    pub fn new(endpoint: &'static str, alias: impl Into<String>, timeout: Duration) -> Self {
        Self {
            request_id: uuid::Uuid::now_v7().to_string(),
            endpoint,
            alias: alias.into(),
            client_key_id: None,
            client_ip: None,
            deadline: Instant::now() + timeout,
            attempt: 0,
            outcomes: Vec::new(),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn record(
        &mut self,
        provider: &str,
        model: &str,
        key_id: Option<&str>,
        outcome: AttemptOutcome,
        message: Option<String>,
    ) {
        self.outcomes.push(AttemptRecord {
            provider: provider.to_string(),
            model: model.to_string(),
            key_id: key_id.map(|id| id.to_string()),
            outcome,
            message,
        });
    }
}

/// What happened on one candidate. Circuit/no-key/unsupported never reach an
/// adapter; everything else is the adapter's normalized classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    CircuitOpen,
    NoKey,
    Unsupported,
    Upstream(Outcome),
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::CircuitOpen => "circuit_open",
            AttemptOutcome::NoKey => "no_key",
            AttemptOutcome::Unsupported => "unsupported",
            AttemptOutcome::Upstream(outcome) => outcome.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub provider: String,
    pub model: String,
    /// The key's logging handle, never its secret.
    pub key_id: Option<String>,
    pub outcome: AttemptOutcome,
    /// Secret-sanitized upstream message, when one was captured.
    pub message: Option<String>,
}
