use std::time::Duration;

use oproxy_protocol::ErrorEnvelope;

use crate::context::AttemptRecord;

/// Terminal request outcomes. Each variant maps to exactly one HTTP status
/// and one client-visible error type; retryable upstream outcomes never
/// surface here, they accumulate in the request context instead.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid or missing client credentials")]
    InvalidAuth,
    #[error("rate limit exceeded on {axis} axis")]
    RateLimitedClient {
        axis: &'static str,
        retry_after: Duration,
    },
    #[error("no model mapping for alias `{alias}`")]
    ModelNotFound { alias: String },
    #[error("upstream rejected the request: {message}")]
    BadRequestUpstream { message: String },
    #[error("all upstream candidates exhausted")]
    UpstreamUnavailable {
        /// Most recent upstream message, already secret-sanitized.
        message: Option<String>,
        outcomes: Vec<AttemptRecord>,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn status(&self) -> u16 {
        match self {
            DispatchError::InvalidAuth => 401,
            DispatchError::RateLimitedClient { .. } => 429,
            DispatchError::ModelNotFound { .. } => 404,
            DispatchError::BadRequestUpstream { .. } => 400,
            DispatchError::UpstreamUnavailable { .. } => 502,
            DispatchError::Internal(_) => 500,
        }
    }

    pub fn client_type(&self) -> &'static str {
        match self {
            DispatchError::InvalidAuth
            | DispatchError::ModelNotFound { .. }
            | DispatchError::BadRequestUpstream { .. } => "invalid_request_error",
            DispatchError::RateLimitedClient { .. } => "rate_limit_exceeded",
            DispatchError::UpstreamUnavailable { .. } | DispatchError::Internal(_) => "api_error",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DispatchError::RateLimitedClient { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// The client-visible body. Never includes stack traces or secrets; the
    /// upstream message for exhaustion has been sanitized at classify time.
    pub fn to_envelope(&self) -> ErrorEnvelope {
        let message = match self {
            DispatchError::InvalidAuth => "invalid or missing API key".to_string(),
            DispatchError::RateLimitedClient { .. } => {
                "rate limit exceeded, retry later".to_string()
            }
            DispatchError::ModelNotFound { alias } => {
                format!("model `{alias}` does not exist or is not available")
            }
            DispatchError::BadRequestUpstream { message } => message.clone(),
            DispatchError::UpstreamUnavailable { message, .. } => message
                .clone()
                .unwrap_or_else(|| "all upstream providers are unavailable".to_string()),
            DispatchError::Internal(_) => "internal server error".to_string(),
        };
        ErrorEnvelope::new(self.client_type(), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_fixed_statuses() {
        assert_eq!(DispatchError::InvalidAuth.status(), 401);
        assert_eq!(
            DispatchError::RateLimitedClient {
                axis: "global",
                retry_after: Duration::from_secs(30)
            }
            .status(),
            429
        );
        assert_eq!(
            DispatchError::ModelNotFound {
                alias: "x".to_string()
            }
            .status(),
            404
        );
        assert_eq!(
            DispatchError::UpstreamUnavailable {
                message: None,
                outcomes: Vec::new()
            }
            .status(),
            502
        );
    }

    #[test]
    fn internal_errors_never_leak_details_to_clients() {
        let err = DispatchError::Internal("db connection pool exhausted at src/db.rs".to_string());
        let envelope = err.to_envelope();
        assert_eq!(envelope.error.message, "internal server error");
    }
}
