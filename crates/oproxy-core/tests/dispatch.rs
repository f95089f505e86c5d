use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use oproxy_core::breaker::{BreakerConfig, CircuitBreaker, CircuitPhase};
use oproxy_core::context::{AttemptOutcome, RequestContext};
use oproxy_core::engine::{DispatchEngine, DispatchRequest, DispatchResponse};
use oproxy_core::error::DispatchError;
use oproxy_core::limiter::{RateLimiter, RateLimiterConfig};
use oproxy_core::model_router::ModelRouter;
use oproxy_core::selector::{KeySelector, SelectionStrategy};
use oproxy_core::store::{MemoryStore, SharedStore};
use oproxy_core::upstream_client::UpstreamClient;
use oproxy_provider::{
    KeyVault, Outcome, TransportErrorKind, UpstreamBody, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, header_get,
};
use oproxy_storage::{ApiKeyRow, ConfigSnapshot, MappingRow, ProviderRow};

const MASTER_KEY_HEX_BYTE: &str = "7a";

#[derive(Debug, Clone)]
enum Reply {
    Json(u16, serde_json::Value),
    JsonWithHeaders(u16, serde_json::Value, Vec<(&'static str, &'static str)>),
    Transport(TransportErrorKind),
    /// 200 streamed SSE body: the given frames, then upstream close.
    Stream(Vec<&'static str>),
}

#[derive(Debug, Clone)]
struct RecordedCall {
    url: String,
    authorization: Option<String>,
}

/// Scripted upstream: pops one reply per send and records every call.
struct ScriptedClient {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedClient {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl UpstreamClient for ScriptedClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        self.calls.lock().unwrap().push(RecordedCall {
            url: req.url.clone(),
            authorization: header_get(&req.headers, "authorization").map(|v| v.to_string()),
        });
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .expect("unexpected upstream call");
        Box::pin(async move {
            match reply {
                Reply::Json(status, body) => Ok(UpstreamHttpResponse {
                    status,
                    headers: vec![("content-type".to_string(), "application/json".to_string())],
                    body: UpstreamBody::Bytes(Bytes::from(body.to_string())),
                }),
                Reply::JsonWithHeaders(status, body, extra) => {
                    let mut headers =
                        vec![("content-type".to_string(), "application/json".to_string())];
                    for (name, value) in extra {
                        headers.push((name.to_string(), value.to_string()));
                    }
                    Ok(UpstreamHttpResponse {
                        status,
                        headers,
                        body: UpstreamBody::Bytes(Bytes::from(body.to_string())),
                    })
                }
                Reply::Transport(kind) => {
                    Err(UpstreamFailure::transport(kind, "scripted transport error"))
                }
                Reply::Stream(frames) => {
                    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(8);
                    tokio::spawn(async move {
                        for frame in frames {
                            if tx.send(Bytes::from_static(frame.as_bytes())).await.is_err() {
                                return;
                            }
                        }
                    });
                    Ok(UpstreamHttpResponse {
                        status: 200,
                        headers: vec![(
                            "content-type".to_string(),
                            "text/event-stream".to_string(),
                        )],
                        body: UpstreamBody::Stream(rx),
                    })
                }
            }
        })
    }
}

fn vault() -> KeyVault {
    KeyVault::from_master_key(&MASTER_KEY_HEX_BYTE.repeat(32)).unwrap()
}

fn provider_row(id: i64, name: &str) -> ProviderRow {
    ProviderRow {
        id,
        name: name.to_string(),
        kind: "openai".to_string(),
        base_url: format!("https://{name}.example"),
        config_json: serde_json::json!({}),
        enabled: true,
    }
}

fn key_row(id: i64, provider_id: i64, handle: &str, priority: i32, secret: &str) -> ApiKeyRow {
    ApiKeyRow {
        id,
        provider_id,
        key_id: handle.to_string(),
        secret_ciphertext: vault().seal(secret).unwrap(),
        masked: format!("...{}", &secret[secret.len().saturating_sub(4)..]),
        priority,
        rpm_limit: None,
        tpm_limit: None,
        daily_quota: None,
        status: "active".to_string(),
        failure_count: 0,
        last_used_at: None,
    }
}

fn mapping_row(id: i64, alias: &str, provider_id: i64, model: &str, order: i32) -> MappingRow {
    MappingRow {
        id,
        alias: alias.to_string(),
        provider_id,
        provider_model: model.to_string(),
        order_index: order,
        is_default: false,
        override_json: serde_json::Value::Null,
        enabled: true,
    }
}

struct Harness {
    engine: DispatchEngine,
    client: Arc<ScriptedClient>,
    store: Arc<dyn SharedStore>,
}

fn harness(snapshot: ConfigSnapshot) -> Harness {
    harness_with_breaker(
        snapshot,
        BreakerConfig {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
            probe_count: 1,
        },
    )
}

fn harness_with_breaker(snapshot: ConfigSnapshot, breaker_config: BreakerConfig) -> Harness {
    let client = ScriptedClient::new();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let limiter = Arc::new(RateLimiter::new(
        Arc::clone(&store),
        RateLimiterConfig {
            window: Duration::from_secs(60),
            global_rpm: 10_000,
            key_rpm: 10_000,
            ip_rpm: 10_000,
        },
    ));
    let engine = DispatchEngine::new(
        Arc::new(ModelRouter::new(&snapshot)),
        CircuitBreaker::new(Arc::clone(&store), breaker_config),
        Arc::new(KeySelector::new(SelectionStrategy::Priority)),
        vault(),
        limiter,
        client.clone(),
        None,
    );
    Harness {
        engine,
        client,
        store,
    }
}

fn chat_request(alias: &str, stream: bool) -> DispatchRequest {
    let mut body = serde_json::json!({
        "model": alias,
        "messages": [{"role": "user", "content": "Hi"}],
    });
    if stream {
        body["stream"] = serde_json::json!(true);
    }
    DispatchRequest::Chat(serde_json::from_value(body).unwrap())
}

fn ok_chat_body(model: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-ok",
        "object": "chat.completion",
        "created": 1700000000,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
    })
}

fn ctx(alias: &str) -> RequestContext {
    RequestContext::new("/v1/chat/completions", alias, Duration::from_secs(30))
}

async fn collect_stream(mut rx: oproxy_provider::ByteStream) -> Vec<String> {
    let mut frames = Vec::new();
    while let Some(chunk) = rx.recv().await {
        frames.push(String::from_utf8(chunk.to_vec()).unwrap());
    }
    frames
}

// Scenario 1: one healthy mapping and key; unary chat succeeds on the first
// attempt with no accumulated fallback outcomes.
#[tokio::test]
async fn happy_path_unary_chat() {
    let snapshot = ConfigSnapshot {
        providers: vec![provider_row(1, "provider-a")],
        api_keys: vec![key_row(10, 1, "a-1", 1, "sk-alpha-0001")],
        mappings: vec![mapping_row(100, "gpt-3.5-turbo", 1, "gpt-3.5-turbo", 0)],
        client_keys: Vec::new(),
    };
    let harness = harness(snapshot);
    harness
        .client
        .push(Reply::Json(200, ok_chat_body("gpt-3.5-turbo")));

    let mut ctx = ctx("gpt-3.5-turbo");
    let response = harness
        .engine
        .dispatch(&mut ctx, chat_request("gpt-3.5-turbo", false))
        .await
        .unwrap();

    let DispatchResponse::Chat(completion) = response else {
        panic!("expected unary chat response");
    };
    assert_eq!(completion.choices[0].message.role, oproxy_protocol::chat::Role::Assistant);
    assert!(ctx.outcomes.is_empty());
    assert_eq!(harness.client.call_count(), 1);
}

// Scenario 2: key #1 fails auth on three separate requests (falling over to
// key #2 each time); the fourth request must skip the demoted key entirely.
#[tokio::test]
async fn key_failover_after_repeated_auth_failures() {
    let snapshot = ConfigSnapshot {
        providers: vec![provider_row(1, "provider-a")],
        api_keys: vec![
            key_row(10, 1, "a-1", 1, "sk-alpha-0001"),
            key_row(11, 1, "a-2", 2, "sk-alpha-0002"),
        ],
        mappings: vec![mapping_row(100, "gpt-4", 1, "gpt-4o", 0)],
        client_keys: Vec::new(),
    };
    let harness = harness(snapshot);
    let auth_error = serde_json::json!({"error": {"message": "bad key", "type": "invalid_api_key"}});

    for _ in 0..3 {
        harness.client.push(Reply::Json(401, auth_error.clone()));
        harness.client.push(Reply::Json(200, ok_chat_body("gpt-4o")));
        let mut ctx = ctx("gpt-4");
        harness
            .engine
            .dispatch(&mut ctx, chat_request("gpt-4", false))
            .await
            .unwrap();
        assert_eq!(
            ctx.outcomes
                .iter()
                .filter(|o| o.outcome == AttemptOutcome::Upstream(Outcome::AuthFailed))
                .count(),
            1
        );
    }
    assert_eq!(harness.client.call_count(), 6);

    // Fourth request: key a-1 is failed; a-2 is selected directly.
    harness.client.push(Reply::Json(200, ok_chat_body("gpt-4o")));
    let mut ctx4 = ctx("gpt-4");
    harness
        .engine
        .dispatch(&mut ctx4, chat_request("gpt-4", false))
        .await
        .unwrap();
    assert_eq!(harness.client.call_count(), 7);
    assert!(ctx4.outcomes.is_empty());
    let calls = harness.client.calls();
    assert_eq!(
        calls.last().unwrap().authorization.as_deref(),
        Some("Bearer sk-alpha-0002")
    );
}

// Scenario 3: provider A server-errors, provider B serves the request.
#[tokio::test]
async fn provider_failover_on_server_error() {
    let snapshot = ConfigSnapshot {
        providers: vec![provider_row(1, "provider-a"), provider_row(2, "provider-b")],
        api_keys: vec![
            key_row(10, 1, "a-1", 1, "sk-alpha-0001"),
            key_row(20, 2, "b-1", 1, "sk-bravo-0001"),
        ],
        mappings: vec![
            mapping_row(100, "gpt-4", 1, "gpt-4-a", 0),
            mapping_row(101, "gpt-4", 2, "gpt-4-b", 1),
        ],
        client_keys: Vec::new(),
    };
    let harness = harness(snapshot);
    harness
        .client
        .push(Reply::Json(500, serde_json::json!({"error": {"message": "boom"}})));
    harness.client.push(Reply::Json(200, ok_chat_body("gpt-4-b")));

    let mut ctx = ctx("gpt-4");
    let response = harness
        .engine
        .dispatch(&mut ctx, chat_request("gpt-4", false))
        .await
        .unwrap();

    assert!(matches!(response, DispatchResponse::Chat(_)));
    assert_eq!(harness.client.call_count(), 2);
    assert_eq!(ctx.outcomes.len(), 1);
    assert_eq!(ctx.outcomes[0].provider, "provider-a");
    assert_eq!(
        ctx.outcomes[0].outcome,
        AttemptOutcome::Upstream(Outcome::ServerError)
    );
    let calls = harness.client.calls();
    assert!(calls[0].url.starts_with("https://provider-a.example"));
    assert!(calls[1].url.starts_with("https://provider-b.example"));
}

// Scenario 4: three server errors trip the breaker (F=3); the fourth request
// is short-circuited without reaching the adapter and state reads open.
#[tokio::test]
async fn circuit_opens_after_threshold_failures() {
    let snapshot = ConfigSnapshot {
        providers: vec![provider_row(1, "provider-a")],
        api_keys: vec![key_row(10, 1, "a-1", 1, "sk-alpha-0001")],
        mappings: vec![mapping_row(100, "gpt-4", 1, "gpt-4-a", 0)],
        client_keys: Vec::new(),
    };
    let harness = harness_with_breaker(
        snapshot,
        BreakerConfig {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
            probe_count: 1,
        },
    );

    for _ in 0..3 {
        harness
            .client
            .push(Reply::Json(500, serde_json::json!({"error": {"message": "boom"}})));
        let mut ctx = ctx("gpt-4");
        let err = harness
            .engine
            .dispatch(&mut ctx, chat_request("gpt-4", false))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UpstreamUnavailable { .. }));
    }
    assert_eq!(harness.client.call_count(), 3);

    // Fourth request: no upstream call at all.
    let mut ctx4 = ctx("gpt-4");
    let err = harness
        .engine
        .dispatch(&mut ctx4, chat_request("gpt-4", false))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::UpstreamUnavailable { .. }));
    assert_eq!(harness.client.call_count(), 3);
    assert_eq!(ctx4.outcomes.len(), 1);
    assert_eq!(ctx4.outcomes[0].outcome, AttemptOutcome::CircuitOpen);

    let breaker = CircuitBreaker::new(
        Arc::clone(&harness.store),
        BreakerConfig {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
            probe_count: 1,
        },
    );
    assert_eq!(breaker.current_phase(1).await, CircuitPhase::Open);
}

// Scenario 5: provider A dies after two streamed chunks. The client sees
// those chunks plus a final error event and [DONE]; provider B is never
// called because the first byte was already forwarded.
#[tokio::test]
async fn streaming_never_falls_back_mid_stream() {
    let snapshot = ConfigSnapshot {
        providers: vec![provider_row(1, "provider-a"), provider_row(2, "provider-b")],
        api_keys: vec![
            key_row(10, 1, "a-1", 1, "sk-alpha-0001"),
            key_row(20, 2, "b-1", 1, "sk-bravo-0001"),
        ],
        mappings: vec![
            mapping_row(100, "gpt-4", 1, "gpt-4-a", 0),
            mapping_row(101, "gpt-4", 2, "gpt-4-b", 1),
        ],
        client_keys: Vec::new(),
    };
    let harness = harness(snapshot);
    harness.client.push(Reply::Stream(vec![
        "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4-a\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4-a\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
    ]));

    let mut ctx = ctx("gpt-4");
    let response = harness
        .engine
        .dispatch(&mut ctx, chat_request("gpt-4", true))
        .await
        .unwrap();
    let DispatchResponse::ChatStream(rx) = response else {
        panic!("expected stream");
    };
    let frames = collect_stream(rx).await;

    assert_eq!(frames.len(), 4);
    assert!(frames[1].contains("\"content\":\"Hel\""));
    assert!(frames[2].contains("api_error"));
    assert!(frames[3].contains("[DONE]"));
    assert_eq!(harness.client.call_count(), 1);
}

// Scenario 6: per-key client rate limit of 2/min; the third request is
// denied before any dispatch happens.
#[tokio::test]
async fn client_rate_limit_denies_third_request() {
    let snapshot = ConfigSnapshot {
        providers: vec![provider_row(1, "provider-a")],
        api_keys: vec![key_row(10, 1, "a-1", 1, "sk-alpha-0001")],
        mappings: vec![mapping_row(100, "gpt-4", 1, "gpt-4-a", 0)],
        client_keys: Vec::new(),
    };
    let harness = harness(snapshot);
    let limiter = RateLimiter::new(
        Arc::clone(&harness.store),
        RateLimiterConfig {
            window: Duration::from_secs(60),
            global_rpm: 1000,
            key_rpm: 2,
            ip_rpm: 1000,
        },
    );

    for _ in 0..2 {
        limiter.check(42, None, None).await.unwrap();
        harness.client.push(Reply::Json(200, ok_chat_body("gpt-4-a")));
        let mut ctx = ctx("gpt-4");
        harness
            .engine
            .dispatch(&mut ctx, chat_request("gpt-4", false))
            .await
            .unwrap();
    }

    // Third request: denied at the gate, engine never invoked.
    let denied = limiter.check(42, None, None).await.unwrap_err();
    assert!(denied.retry_after > Duration::ZERO);
    assert!(denied.retry_after <= Duration::from_secs(60));
    assert_eq!(harness.client.call_count(), 2);
}

// Boundary: an already-expired deadline makes no upstream call and surfaces
// exhaustion with a timeout outcome.
#[tokio::test]
async fn zero_deadline_times_out_without_upstream_call() {
    let snapshot = ConfigSnapshot {
        providers: vec![provider_row(1, "provider-a")],
        api_keys: vec![key_row(10, 1, "a-1", 1, "sk-alpha-0001")],
        mappings: vec![mapping_row(100, "gpt-4", 1, "gpt-4-a", 0)],
        client_keys: Vec::new(),
    };
    let harness = harness(snapshot);

    let mut ctx = RequestContext::new("/v1/chat/completions", "gpt-4", Duration::ZERO);
    let err = harness
        .engine
        .dispatch(&mut ctx, chat_request("gpt-4", false))
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::UpstreamUnavailable { .. }));
    assert_eq!(harness.client.call_count(), 0);
    assert_eq!(
        ctx.outcomes[0].outcome,
        AttemptOutcome::Upstream(Outcome::Timeout)
    );
}

// Boundary: unknown alias fails fast, no key is ever unsealed.
#[tokio::test]
async fn unknown_alias_is_model_not_found() {
    let harness = harness(ConfigSnapshot::default());
    let mut ctx = ctx("missing-model");
    let err = harness
        .engine
        .dispatch(&mut ctx, chat_request("missing-model", false))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::ModelNotFound { .. }));
    assert_eq!(harness.client.call_count(), 0);
}

// Boundary: every candidate lacks an eligible key; the outcome list shows a
// no_key entry per candidate.
#[tokio::test]
async fn no_eligible_keys_surfaces_no_key_per_candidate() {
    let mut key_a = key_row(10, 1, "a-1", 1, "sk-alpha-0001");
    key_a.status = "disabled".to_string();
    let mut key_b = key_row(20, 2, "b-1", 1, "sk-bravo-0001");
    key_b.status = "failed".to_string();
    let snapshot = ConfigSnapshot {
        providers: vec![provider_row(1, "provider-a"), provider_row(2, "provider-b")],
        api_keys: vec![key_a, key_b],
        mappings: vec![
            mapping_row(100, "gpt-4", 1, "gpt-4-a", 0),
            mapping_row(101, "gpt-4", 2, "gpt-4-b", 1),
        ],
        client_keys: Vec::new(),
    };
    let harness = harness(snapshot);

    let mut ctx = ctx("gpt-4");
    let err = harness
        .engine
        .dispatch(&mut ctx, chat_request("gpt-4", false))
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::UpstreamUnavailable { .. }));
    assert_eq!(harness.client.call_count(), 0);
    assert_eq!(ctx.outcomes.len(), 2);
    assert!(ctx
        .outcomes
        .iter()
        .all(|record| record.outcome == AttemptOutcome::NoKey));
}

// Boundary: a 429 whose Retry-After exceeds the remaining deadline counts as
// exhaustion for that provider within this request.
#[tokio::test]
async fn retry_after_beyond_deadline_exhausts_provider() {
    let snapshot = ConfigSnapshot {
        providers: vec![provider_row(1, "provider-a")],
        api_keys: vec![key_row(10, 1, "a-1", 1, "sk-alpha-0001")],
        mappings: vec![mapping_row(100, "gpt-4", 1, "gpt-4-a", 0)],
        client_keys: Vec::new(),
    };
    let harness = harness(snapshot);
    harness.client.push(Reply::JsonWithHeaders(
        429,
        serde_json::json!({"error": {"message": "slow down", "code": "rate_limited"}}),
        vec![("retry-after", "300")],
    ));

    let mut ctx = ctx("gpt-4");
    let err = harness
        .engine
        .dispatch(&mut ctx, chat_request("gpt-4", false))
        .await
        .unwrap_err();

    let DispatchError::UpstreamUnavailable { outcomes, .. } = err else {
        panic!("expected exhaustion");
    };
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        outcomes[0].outcome,
        AttemptOutcome::Upstream(Outcome::RateLimited { .. })
    ));
    assert_eq!(harness.client.call_count(), 1);
}

// A 400 from the upstream is terminal: no fallback to the second provider,
// and the upstream's message reaches the caller.
#[tokio::test]
async fn upstream_bad_request_is_terminal() {
    let snapshot = ConfigSnapshot {
        providers: vec![provider_row(1, "provider-a"), provider_row(2, "provider-b")],
        api_keys: vec![
            key_row(10, 1, "a-1", 1, "sk-alpha-0001"),
            key_row(20, 2, "b-1", 1, "sk-bravo-0001"),
        ],
        mappings: vec![
            mapping_row(100, "gpt-4", 1, "gpt-4-a", 0),
            mapping_row(101, "gpt-4", 2, "gpt-4-b", 1),
        ],
        client_keys: Vec::new(),
    };
    let harness = harness(snapshot);
    harness.client.push(Reply::Json(
        400,
        serde_json::json!({"error": {"message": "messages must not be empty", "type": "invalid_request_error"}}),
    ));

    let mut ctx = ctx("gpt-4");
    let err = harness
        .engine
        .dispatch(&mut ctx, chat_request("gpt-4", false))
        .await
        .unwrap_err();

    let DispatchError::BadRequestUpstream { message } = err else {
        panic!("expected bad request");
    };
    assert_eq!(message, "messages must not be empty");
    assert_eq!(harness.client.call_count(), 1);
}

// Transport failures classify as network errors and fall through to the
// next provider without tripping the terminal path.
#[tokio::test]
async fn network_error_falls_back_to_next_provider() {
    let snapshot = ConfigSnapshot {
        providers: vec![provider_row(1, "provider-a"), provider_row(2, "provider-b")],
        api_keys: vec![
            key_row(10, 1, "a-1", 1, "sk-alpha-0001"),
            key_row(20, 2, "b-1", 1, "sk-bravo-0001"),
        ],
        mappings: vec![
            mapping_row(100, "gpt-4", 1, "gpt-4-a", 0),
            mapping_row(101, "gpt-4", 2, "gpt-4-b", 1),
        ],
        client_keys: Vec::new(),
    };
    let harness = harness(snapshot);
    harness
        .client
        .push(Reply::Transport(TransportErrorKind::Connect));
    harness.client.push(Reply::Json(200, ok_chat_body("gpt-4-b")));

    let mut ctx = ctx("gpt-4");
    let response = harness
        .engine
        .dispatch(&mut ctx, chat_request("gpt-4", false))
        .await
        .unwrap();
    assert!(matches!(response, DispatchResponse::Chat(_)));
    assert_eq!(
        ctx.outcomes[0].outcome,
        AttemptOutcome::Upstream(Outcome::NetworkError)
    );
}

// The secret never appears in recorded outcomes even when the upstream
// echoes it back in an error body.
#[tokio::test]
async fn upstream_error_bodies_are_secret_sanitized() {
    let snapshot = ConfigSnapshot {
        providers: vec![provider_row(1, "provider-a")],
        api_keys: vec![key_row(10, 1, "a-1", 1, "sk-alpha-0001")],
        mappings: vec![mapping_row(100, "gpt-4", 1, "gpt-4-a", 0)],
        client_keys: Vec::new(),
    };
    let harness = harness(snapshot);
    harness.client.push(Reply::Json(
        500,
        serde_json::json!({"error": {"message": "upstream refused sk-alpha-0001 at edge"}}),
    ));

    let mut ctx = ctx("gpt-4");
    let err = harness
        .engine
        .dispatch(&mut ctx, chat_request("gpt-4", false))
        .await
        .unwrap_err();

    let DispatchError::UpstreamUnavailable { message, outcomes } = err else {
        panic!("expected exhaustion");
    };
    let message = message.unwrap();
    assert!(!message.contains("sk-alpha-0001"));
    assert!(message.contains("...0001"));
    assert!(outcomes
        .iter()
        .all(|record| !record.message.as_deref().unwrap_or("").contains("sk-alpha-0001")));
}
