use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;

use oproxy_protocol::chat::{ChatCompletion, ChatCompletionChunk, ChatCompletionRequestBody};
use oproxy_protocol::chat::request::StreamOptions;
use oproxy_protocol::completion::{Completion, CompletionRequestBody};
use oproxy_protocol::embedding::{EmbeddingRequestBody, EmbeddingResponse};
use oproxy_protocol::sse::{SseDecoder, done_frame, encode_data};
use oproxy_protocol::{ErrorEnvelope, Usage};
use oproxy_provider::{
    ByteStream, Capability, KeyVault, MappingOverride, Outcome, ProviderAdapter, TransportErrorKind,
    UnsealedKey, UpstreamBody, UpstreamFailure, UpstreamHttpRequest, adapter_for,
};
use oproxy_storage::ConfigStore;

use crate::breaker::{Admission, CircuitBreaker};
use crate::context::{AttemptOutcome, RequestContext};
use crate::error::DispatchError;
use crate::limiter::{ChargeVerdict, RateLimiter};
use crate::metrics;
use crate::model_router::{Candidate, ModelRouter};
use crate::selector::{KeyEvent, KeyRecord, KeySelector};
use crate::upstream_client::UpstreamClient;

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// A validated, normalized client request ready for dispatch.
#[derive(Debug, Clone)]
pub enum DispatchRequest {
    Chat(ChatCompletionRequestBody),
    Completion(CompletionRequestBody),
    Embedding(EmbeddingRequestBody),
}

impl DispatchRequest {
    pub fn alias(&self) -> &str {
        match self {
            DispatchRequest::Chat(body) => &body.model,
            DispatchRequest::Completion(body) => &body.model,
            DispatchRequest::Embedding(body) => &body.model,
        }
    }

    pub fn wants_stream(&self) -> bool {
        match self {
            DispatchRequest::Chat(body) => body.stream.unwrap_or(false),
            DispatchRequest::Completion(body) => body.stream.unwrap_or(false),
            DispatchRequest::Embedding(_) => false,
        }
    }

    fn capability(&self) -> Capability {
        match self {
            DispatchRequest::Chat(_) => Capability::ChatCompletion,
            DispatchRequest::Completion(_) => Capability::Completion,
            DispatchRequest::Embedding(_) => Capability::Embedding,
        }
    }

    /// Clone for one candidate: swap in the provider-native model name and
    /// merge the mapping override (client wins unless forced).
    fn for_candidate(&self, provider_model: &str, override_config: &MappingOverride) -> Self {
        match self {
            DispatchRequest::Chat(body) => {
                let mut body = body.clone();
                body.model = provider_model.to_string();
                override_config.apply_chat(&mut body);
                if body.stream.unwrap_or(false) {
                    // Usage accounting needs the final usage chunk.
                    let options = body.stream_options.get_or_insert(StreamOptions::default());
                    options.include_usage.get_or_insert(true);
                }
                DispatchRequest::Chat(body)
            }
            DispatchRequest::Completion(body) => {
                let mut body = body.clone();
                body.model = provider_model.to_string();
                override_config.apply_completion(&mut body);
                DispatchRequest::Completion(body)
            }
            DispatchRequest::Embedding(body) => {
                let mut body = body.clone();
                body.model = provider_model.to_string();
                DispatchRequest::Embedding(body)
            }
        }
    }
}

#[derive(Debug)]
pub enum DispatchResponse {
    Chat(ChatCompletion),
    Completion(Completion),
    Embedding(EmbeddingResponse),
    /// OpenAI-shaped SSE frames terminated by `[DONE]`.
    ChatStream(ByteStream),
}

struct AttemptSuccess {
    response: oproxy_provider::UpstreamHttpResponse,
}

/// Drives the ranked candidate list for one request: circuit gate, key
/// selection, override merge, unseal, adapter call, observation, fallback.
pub struct DispatchEngine {
    router: Arc<ModelRouter>,
    breaker: CircuitBreaker,
    selector: Arc<KeySelector>,
    vault: KeyVault,
    limiter: Arc<RateLimiter>,
    client: Arc<dyn UpstreamClient>,
    storage: Option<ConfigStore>,
}

impl DispatchEngine {
    pub fn new(
        router: Arc<ModelRouter>,
        breaker: CircuitBreaker,
        selector: Arc<KeySelector>,
        vault: KeyVault,
        limiter: Arc<RateLimiter>,
        client: Arc<dyn UpstreamClient>,
        storage: Option<ConfigStore>,
    ) -> Self {
        Self {
            router,
            breaker,
            selector,
            vault,
            limiter,
            client,
            storage,
        }
    }

    pub async fn dispatch(
        &self,
        ctx: &mut RequestContext,
        request: DispatchRequest,
    ) -> Result<DispatchResponse, DispatchError> {
        let candidates = self.router.resolve(&ctx.alias);
        if candidates.is_empty() {
            return Err(DispatchError::ModelNotFound {
                alias: ctx.alias.clone(),
            });
        }

        let mut last_message: Option<String> = None;

        'candidates: for candidate in candidates {
            let provider = candidate.provider.name.clone();
            let model = candidate.provider_model.clone();

            if ctx.remaining().is_zero() {
                ctx.record(
                    &provider,
                    &model,
                    None,
                    AttemptOutcome::Upstream(Outcome::Timeout),
                    Some("deadline exhausted before attempt".to_string()),
                );
                break;
            }

            let adapter = adapter_for(candidate.provider.kind);
            if !adapter.supports(request.capability()) {
                ctx.record(&provider, &model, None, AttemptOutcome::Unsupported, None);
                continue;
            }

            if let Admission::Open { retry_after } =
                self.breaker.admit(candidate.provider.provider_id).await
            {
                tracing::debug!(
                    request_id = %ctx.request_id,
                    provider = %provider,
                    retry_after_secs = retry_after.as_secs(),
                    "provider circuit open, skipping"
                );
                ctx.record(&provider, &model, None, AttemptOutcome::CircuitOpen, None);
                metrics::record_fallback(&ctx.alias, "circuit_open");
                continue;
            }

            let prepared =
                request.for_candidate(&candidate.provider_model, &candidate.override_config);

            let mut tried_keys: Vec<i64> = Vec::new();
            let failed_outcome = 'keys: loop {
                let Some(key) = self
                    .selector
                    .acquire(candidate.provider.provider_id, &candidate.keys, &tried_keys)
                    .await
                else {
                    if tried_keys.is_empty() {
                        ctx.record(&provider, &model, None, AttemptOutcome::NoKey, None);
                        metrics::record_fallback(&ctx.alias, "no_key");
                    }
                    continue 'candidates;
                };

                match self
                    .run_attempts(ctx, &candidate, adapter, &key, &prepared)
                    .await
                {
                    Ok(success) => {
                        return self.finish(ctx, &candidate, &key, &prepared, success).await;
                    }
                    Err((outcome, message)) => {
                        if message.is_some() {
                            last_message = message.clone();
                        }
                        ctx.record(
                            &provider,
                            &model,
                            Some(&key.key_id),
                            AttemptOutcome::Upstream(outcome),
                            message,
                        );
                        match outcome {
                            Outcome::BadRequest => {
                                // Terminal: the upstream's message is
                                // preserved for the client.
                                return Err(DispatchError::BadRequestUpstream {
                                    message: last_message.unwrap_or_else(|| {
                                        "upstream rejected the request".to_string()
                                    }),
                                });
                            }
                            Outcome::AuthFailed | Outcome::QuotaExhausted => {
                                tried_keys.push(key.id);
                                continue 'keys;
                            }
                            other => break 'keys other,
                        }
                    }
                }
            };

            metrics::record_fallback(&ctx.alias, failed_outcome.as_str());
        }

        Err(DispatchError::UpstreamUnavailable {
            message: last_message,
            outcomes: ctx.outcomes.clone(),
        })
    }

    /// Up to `max_retries` attempts against one (candidate, key) pair, with
    /// full-jitter exponential backoff between same-provider retries. Only
    /// `server_error`/`timeout`/`network_error` re-attempt here; everything
    /// else is the caller's fallback decision.
    async fn run_attempts(
        &self,
        ctx: &mut RequestContext,
        candidate: &Candidate,
        adapter: &'static dyn ProviderAdapter,
        key: &KeyRecord,
        prepared: &DispatchRequest,
    ) -> Result<AttemptSuccess, (Outcome, Option<String>)> {
        let max_attempts = candidate.provider.settings.max_retries.max(1);
        let mut last: (Outcome, Option<String>) = (Outcome::ServerError, None);

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = backoff_delay(attempt - 1).min(ctx.remaining());
                tokio::time::sleep(delay).await;
            }
            ctx.attempt += 1;

            let secret = match self.vault.unseal(&key.ciphertext) {
                Ok(secret) => secret,
                Err(err) => {
                    // Undecryptable credentials behave like rejected ones so
                    // the selector eventually demotes them.
                    self.observe(candidate, key, &Outcome::AuthFailed).await;
                    return Err((
                        Outcome::AuthFailed,
                        Some(format!("credential unusable: {err}")),
                    ));
                }
            };

            let upstream_req = match build_request(adapter, candidate, &secret, prepared) {
                Ok(upstream_req) => upstream_req,
                Err(err) => {
                    return Err((Outcome::ServerError, Some(err.to_string())));
                }
            };

            let attempt_timeout = ctx.remaining().min(candidate.provider.settings.timeout);
            if attempt_timeout.is_zero() {
                self.observe(candidate, key, &Outcome::Timeout).await;
                return Err((Outcome::Timeout, Some("deadline exhausted".to_string())));
            }

            let result = tokio::time::timeout(attempt_timeout, self.client.send(upstream_req)).await;
            let failure = match result {
                Err(_) => UpstreamFailure::transport(
                    TransportErrorKind::Timeout,
                    "attempt deadline exceeded",
                ),
                Ok(Err(failure)) => failure,
                Ok(Ok(response)) if (200..300).contains(&response.status) => {
                    self.observe(candidate, key, &Outcome::Ok).await;
                    return Ok(AttemptSuccess { response });
                }
                Ok(Ok(response)) => {
                    let body = match response.body {
                        UpstreamBody::Bytes(bytes) => bytes,
                        UpstreamBody::Stream(_) => Bytes::new(),
                    };
                    UpstreamFailure::Http {
                        status: response.status,
                        headers: response.headers,
                        body,
                    }
                }
            };

            let outcome = adapter.classify(&failure);
            self.observe(candidate, key, &outcome).await;
            let message = failure_message(&failure).map(|message| secret.sanitize(&message));
            tracing::debug!(
                request_id = %ctx.request_id,
                provider = %candidate.provider.name,
                key = %key.key_id,
                outcome = outcome.as_str(),
                attempt = ctx.attempt,
                "upstream attempt failed"
            );
            last = (outcome, message);
            if !(outcome.retryable_same_provider() && attempt + 1 < max_attempts) {
                break;
            }
        }
        Err(last)
    }

    /// Feed one attempt outcome into breaker, selector and metrics.
    async fn observe(&self, candidate: &Candidate, key: &KeyRecord, outcome: &Outcome) {
        metrics::record_provider(
            &candidate.provider.name,
            &candidate.provider_model,
            outcome.as_str(),
        );
        if matches!(outcome, Outcome::Ok) {
            self.breaker
                .record_success(candidate.provider.provider_id)
                .await;
        } else if outcome.trips_breaker() {
            self.breaker
                .record_failure(candidate.provider.provider_id)
                .await;
        }
        if let Some(KeyEvent::Demoted { failure_count }) =
            self.selector.observe(key, outcome).await
        {
            tracing::warn!(
                provider = %candidate.provider.name,
                key = %key.key_id,
                failure_count,
                "key demoted to failed after repeated auth/quota errors"
            );
            if let Some(storage) = self.storage.clone() {
                let key_id = key.id;
                tokio::spawn(async move {
                    if let Err(err) = storage
                        .set_api_key_status(key_id, "failed", failure_count as i32)
                        .await
                    {
                        tracing::warn!(error = %err, "failed to persist key demotion");
                    }
                });
            }
        }
    }

    async fn finish(
        &self,
        ctx: &mut RequestContext,
        candidate: &Candidate,
        key: &KeyRecord,
        prepared: &DispatchRequest,
        success: AttemptSuccess,
    ) -> Result<DispatchResponse, DispatchError> {
        let AttemptSuccess { response } = success;
        let adapter = adapter_for(candidate.provider.kind);

        if prepared.wants_stream() {
            let upstream = match response.body {
                UpstreamBody::Stream(rx) => rx,
                UpstreamBody::Bytes(bytes) => single_chunk_stream(bytes),
            };
            let adapted = adapter.adapt_chat_stream(&candidate.provider, upstream);
            let guarded = self.guard_stream(ctx.request_id.clone(), key.clone(), adapted);
            return Ok(DispatchResponse::ChatStream(guarded));
        }

        let body = match response.body {
            UpstreamBody::Bytes(bytes) => bytes,
            UpstreamBody::Stream(_) => {
                return Err(DispatchError::Internal(
                    "unexpected streamed body for unary request".to_string(),
                ));
            }
        };

        let (response, usage) = match prepared {
            DispatchRequest::Chat(_) => {
                let decoded = adapter
                    .decode_chat(&candidate.provider, &body)
                    .map_err(|err| decode_error(ctx, candidate, err))?;
                let usage = decoded.usage;
                (DispatchResponse::Chat(decoded), usage)
            }
            DispatchRequest::Completion(_) => {
                let decoded = adapter
                    .decode_completion(&candidate.provider, &body)
                    .map_err(|err| decode_error(ctx, candidate, err))?;
                let usage = decoded.usage;
                (DispatchResponse::Completion(decoded), usage)
            }
            DispatchRequest::Embedding(_) => {
                let decoded = adapter
                    .decode_embedding(&candidate.provider, &body)
                    .map_err(|err| decode_error(ctx, candidate, err))?;
                let usage = decoded.usage;
                (DispatchResponse::Embedding(decoded), usage)
            }
        };

        self.charge_usage(key, usage).await;
        Ok(response)
    }

    async fn charge_usage(&self, key: &KeyRecord, usage: Option<Usage>) {
        let Some(usage) = usage else {
            return;
        };
        let verdict = self
            .limiter
            .charge_tokens(&key.key_id, usage.total_tokens, key.tpm_limit, key.daily_quota)
            .await;
        match verdict {
            ChargeVerdict::WithinBudget => {}
            ChargeVerdict::TpmExceeded { cooldown } | ChargeVerdict::DailyExceeded { cooldown } => {
                tracing::info!(
                    key = %key.key_id,
                    cooldown_secs = cooldown.as_secs(),
                    "key over token budget, cooling down"
                );
                self.selector.mark_over_quota(key.id, cooldown).await;
            }
        }
    }

    /// Forward the adapted stream to the client while watching for the
    /// `[DONE]` terminator and the usage chunk. An upstream that closes
    /// early gets one final error event and a terminator; the engine never
    /// swaps upstreams once the first byte has been forwarded.
    fn guard_stream(&self, request_id: String, key: KeyRecord, mut upstream: ByteStream) -> ByteStream {
        let limiter = Arc::clone(&self.limiter);
        let selector = Arc::clone(&self.selector);
        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);

        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut done = false;
            let mut usage: Option<Usage> = None;

            while let Some(chunk) = upstream.recv().await {
                for frame in decoder.feed(&chunk) {
                    if frame.is_done() {
                        done = true;
                    } else if let Ok(parsed) =
                        serde_json::from_str::<ChatCompletionChunk>(&frame.data)
                        && let Some(chunk_usage) = parsed.usage
                    {
                        usage = Some(chunk_usage);
                    }
                }
                if tx.send(chunk).await.is_err() {
                    // Client disconnected; dropping `upstream` cancels the
                    // producer within one scheduling tick.
                    return;
                }
                if done {
                    break;
                }
            }

            if !done {
                tracing::warn!(request_id = %request_id, "upstream stream ended before [DONE]");
                let envelope =
                    ErrorEnvelope::new("api_error", "upstream stream terminated unexpectedly");
                let payload = String::from_utf8(envelope.to_json_bytes()).unwrap_or_default();
                let _ = tx.send(encode_data(&payload)).await;
                let _ = tx.send(done_frame()).await;
            }

            if let Some(usage) = usage {
                let verdict = limiter
                    .charge_tokens(&key.key_id, usage.total_tokens, key.tpm_limit, key.daily_quota)
                    .await;
                if let ChargeVerdict::TpmExceeded { cooldown }
                | ChargeVerdict::DailyExceeded { cooldown } = verdict
                {
                    selector.mark_over_quota(key.id, cooldown).await;
                }
            }
        });
        rx
    }
}

fn build_request(
    adapter: &'static dyn ProviderAdapter,
    candidate: &Candidate,
    secret: &UnsealedKey,
    prepared: &DispatchRequest,
) -> Result<UpstreamHttpRequest, oproxy_provider::ProviderError> {
    match prepared {
        DispatchRequest::Chat(body) => adapter.build_chat(&candidate.provider, secret, body),
        DispatchRequest::Completion(body) => {
            adapter.build_completion(&candidate.provider, secret, body)
        }
        DispatchRequest::Embedding(body) => {
            adapter.build_embedding(&candidate.provider, secret, body)
        }
    }
}

fn decode_error(
    ctx: &RequestContext,
    candidate: &Candidate,
    err: oproxy_provider::ProviderError,
) -> DispatchError {
    tracing::warn!(
        request_id = %ctx.request_id,
        provider = %candidate.provider.name,
        error = %err,
        "upstream response decode failed"
    );
    DispatchError::Internal(format!("upstream response decode failed: {err}"))
}

fn failure_message(failure: &UpstreamFailure) -> Option<String> {
    match failure {
        UpstreamFailure::Transport { message, .. } => Some(message.clone()),
        UpstreamFailure::Http { body, .. } => {
            ErrorEnvelope::message_from_upstream(body).or_else(|| {
                let text = String::from_utf8_lossy(body);
                let text = text.trim();
                (!text.is_empty()).then(|| text.chars().take(512).collect::<String>())
            })
        }
    }
}

fn single_chunk_stream(bytes: Bytes) -> ByteStream {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(1);
    tokio::spawn(async move {
        let _ = tx.send(bytes).await;
    });
    rx
}

/// Exponential backoff with full jitter: base 100ms, factor 2, cap 2s.
fn backoff_delay(prior_attempts: u32) -> Duration {
    let ceiling = BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(prior_attempts))
        .min(BACKOFF_CAP);
    ceiling.mul_f64(rand::rng().random_range(0.0..1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_under_cap_with_jitter() {
        for attempt in 0..10 {
            let delay = backoff_delay(attempt);
            assert!(delay <= BACKOFF_CAP);
        }
    }

    #[test]
    fn for_candidate_rewrites_model_and_merges_override() {
        let request = DispatchRequest::Chat(
            serde_json::from_value(serde_json::json!({
                "model": "gpt-4",
                "messages": [{"role": "user", "content": "Hi"}],
                "temperature": 0.7,
            }))
            .unwrap(),
        );
        let override_config = MappingOverride {
            temperature: Some(0.2),
            max_tokens: Some(128),
            ..Default::default()
        };
        let DispatchRequest::Chat(prepared) =
            request.for_candidate("gpt-4o-mini", &override_config)
        else {
            panic!("expected chat");
        };
        assert_eq!(prepared.model, "gpt-4o-mini");
        assert_eq!(prepared.temperature, Some(0.7));
        assert_eq!(prepared.max_tokens, Some(128));
    }

    #[test]
    fn streaming_request_opts_into_usage_chunks() {
        let request = DispatchRequest::Chat(
            serde_json::from_value(serde_json::json!({
                "model": "gpt-4",
                "messages": [{"role": "user", "content": "Hi"}],
                "stream": true,
            }))
            .unwrap(),
        );
        let DispatchRequest::Chat(prepared) =
            request.for_candidate("gpt-4o", &MappingOverride::default())
        else {
            panic!("expected chat");
        };
        assert_eq!(
            prepared.stream_options.and_then(|options| options.include_usage),
            Some(true)
        );
    }
}
