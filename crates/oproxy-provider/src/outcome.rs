use std::time::Duration;

use crate::http::{TransportErrorKind, UpstreamFailure, header_get};

/// Normalized classification of one upstream attempt. The category alone
/// decides whether the dispatch engine advances to the next candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    AuthFailed,
    RateLimited { retry_after: Option<Duration> },
    BadRequest,
    ServerError,
    Timeout,
    NetworkError,
    QuotaExhausted,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::AuthFailed => "auth_failed",
            Outcome::RateLimited { .. } => "rate_limited",
            Outcome::BadRequest => "bad_request",
            Outcome::ServerError => "server_error",
            Outcome::Timeout => "timeout",
            Outcome::NetworkError => "network_error",
            Outcome::QuotaExhausted => "quota_exhausted",
        }
    }

    /// Counts toward the provider circuit breaker window.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            Outcome::ServerError | Outcome::Timeout | Outcome::NetworkError
        )
    }

    /// Worth retrying on the same provider (bounded by its max_retries).
    pub fn retryable_same_provider(&self) -> bool {
        matches!(
            self,
            Outcome::ServerError | Outcome::Timeout | Outcome::NetworkError
        )
    }

    /// Worth advancing to the next candidate instead of failing the request.
    pub fn retryable_next_candidate(&self) -> bool {
        !matches!(self, Outcome::Ok | Outcome::BadRequest)
    }
}

/// Map an upstream failure to its normalized category.
///
/// A 429 means quota exhaustion when the error code says so (OpenAI uses
/// `insufficient_quota`), otherwise plain rate limiting with the upstream's
/// Retry-After hint attached.
pub fn classify_failure(failure: &UpstreamFailure) -> Outcome {
    match failure {
        UpstreamFailure::Http {
            status,
            headers,
            body,
        } => match *status {
            401 | 403 => Outcome::AuthFailed,
            429 => {
                if body_error_code(body).is_some_and(|code| code.contains("insufficient_quota")) {
                    Outcome::QuotaExhausted
                } else {
                    Outcome::RateLimited {
                        retry_after: parse_retry_after(headers),
                    }
                }
            }
            400 | 404 | 405 | 409 | 413 | 422 => Outcome::BadRequest,
            status if (500..600).contains(&status) => Outcome::ServerError,
            _ => Outcome::ServerError,
        },
        UpstreamFailure::Transport { kind, .. } => match kind {
            TransportErrorKind::Timeout | TransportErrorKind::ReadTimeout => Outcome::Timeout,
            TransportErrorKind::Connect | TransportErrorKind::Dns | TransportErrorKind::Tls => {
                Outcome::NetworkError
            }
            TransportErrorKind::Other => Outcome::NetworkError,
        },
    }
}

fn parse_retry_after(headers: &crate::http::Headers) -> Option<Duration> {
    let value = header_get(headers, "retry-after")?.trim();
    if value.is_empty() {
        return None;
    }
    value.parse::<u64>().ok().map(Duration::from_secs)
}

fn body_error_code(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get("error")?
        .get("code")
        .or_else(|| value.get("error")?.get("type"))
        .and_then(|code| code.as_str())
        .map(|code| code.to_string())
}
