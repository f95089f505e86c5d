use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tokio_stream::wrappers::ReceiverStream;

use oproxy_core::auth::{ClientAuth, ClientPrincipal};
use oproxy_core::engine::{DispatchEngine, DispatchRequest, DispatchResponse};
use oproxy_core::error::DispatchError;
use oproxy_core::limiter::RateLimiter;
use oproxy_core::model_router::ModelRouter;
use oproxy_core::{RequestContext, metrics};
use oproxy_protocol::ErrorEnvelope;
use oproxy_protocol::models::{ModelList, ModelObject};
use oproxy_provider::ByteStream;

#[derive(Clone)]
pub struct ProxyState {
    pub engine: Arc<DispatchEngine>,
    pub router: Arc<ModelRouter>,
    pub auth: Arc<ClientAuth>,
    pub limiter: Arc<RateLimiter>,
    pub request_timeout: Duration,
}

#[derive(Clone)]
struct RequestMeta {
    principal: ClientPrincipal,
    client_ip: Option<String>,
}

/// The OpenAI-compatible client surface. Everything under /v1 requires a
/// bearer client key; errors use the OpenAI error envelope throughout.
pub fn proxy_router(state: ProxyState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(list_models))
        .layer(middleware::from_fn_with_state(state.clone(), client_auth))
        .with_state(state)
}

async fn client_auth(
    State(state): State<ProxyState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    mut req: axum::http::Request<Body>,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(req.headers()) else {
        return error_response(&DispatchError::InvalidAuth);
    };
    let Some(principal) = state.auth.authenticate(&token) else {
        return error_response(&DispatchError::InvalidAuth);
    };

    let client_ip = client_ip(req.headers(), connect_info.map(|info| info.0));
    req.extensions_mut().insert(RequestMeta {
        principal,
        client_ip,
    });
    next.run(req).await
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let prefix = "Bearer ";
    if value.len() > prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        let token = value[prefix.len()..].trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    None
}

fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        let first = forwarded.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return Some(first.to_string());
        }
    }
    peer.map(|addr| addr.ip().to_string())
}

async fn chat_completions(
    State(state): State<ProxyState>,
    axum::Extension(meta): axum::Extension<RequestMeta>,
    body: Bytes,
) -> Response {
    handle(&state, &meta, "/v1/chat/completions", body, DispatchRequest::Chat).await
}

async fn completions(
    State(state): State<ProxyState>,
    axum::Extension(meta): axum::Extension<RequestMeta>,
    body: Bytes,
) -> Response {
    handle(&state, &meta, "/v1/completions", body, DispatchRequest::Completion).await
}

async fn embeddings(
    State(state): State<ProxyState>,
    axum::Extension(meta): axum::Extension<RequestMeta>,
    body: Bytes,
) -> Response {
    handle(&state, &meta, "/v1/embeddings", body, DispatchRequest::Embedding).await
}

async fn list_models(State(state): State<ProxyState>) -> Response {
    let data = state
        .router
        .aliases()
        .into_iter()
        .map(|alias| ModelObject::new(alias, "oproxy"))
        .collect();
    finish("/v1/models", Instant::now(), json_response(&ModelList::new(data)))
}

async fn handle<T>(
    state: &ProxyState,
    meta: &RequestMeta,
    endpoint: &'static str,
    body: Bytes,
    into_request: impl FnOnce(T) -> DispatchRequest,
) -> Response
where
    T: DeserializeOwned,
{
    let started = Instant::now();

    let parsed: T = match parse_json(&body) {
        Ok(parsed) => parsed,
        Err(message) => {
            let envelope = ErrorEnvelope::new("invalid_request_error", message);
            return finish(
                endpoint,
                started,
                envelope_response(StatusCode::BAD_REQUEST, &envelope, None),
            );
        }
    };
    let request = into_request(parsed);

    if let Err(denied) = state
        .limiter
        .check(
            meta.principal.key_id,
            meta.principal.rpm_limit,
            meta.client_ip.as_deref(),
        )
        .await
    {
        let err = DispatchError::RateLimitedClient {
            axis: denied.axis,
            retry_after: denied.retry_after,
        };
        return finish(endpoint, started, error_response(&err));
    }

    let mut ctx = RequestContext::new(endpoint, request.alias(), state.request_timeout);
    ctx.client_key_id = Some(meta.principal.key_id);
    ctx.client_ip = meta.client_ip.clone();
    let request_id = ctx.request_id.clone();

    let response = match state.engine.dispatch(&mut ctx, request).await {
        Ok(DispatchResponse::Chat(completion)) => json_response(&completion),
        Ok(DispatchResponse::Completion(completion)) => json_response(&completion),
        Ok(DispatchResponse::Embedding(embedding)) => json_response(&embedding),
        Ok(DispatchResponse::ChatStream(stream)) => sse_response(stream),
        Err(err) => {
            tracing::info!(
                request_id = %request_id,
                endpoint,
                alias = %ctx.alias,
                attempts = ctx.outcomes.len(),
                error = %err,
                "request failed"
            );
            error_response(&err)
        }
    };

    let mut response = response;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }
    finish(endpoint, started, response)
}

fn finish(endpoint: &'static str, started: Instant, response: Response) -> Response {
    metrics::record_request(endpoint, response.status().as_u16());
    metrics::record_duration(endpoint, started.elapsed().as_secs_f64());
    response
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, String> {
    if body.is_empty() {
        return Err("missing request body".to_string());
    }
    serde_json::from_slice(body).map_err(|err| format!("invalid request body: {err}"))
}

fn json_response<T: serde::Serialize>(value: &T) -> Response {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn sse_response(stream: ByteStream) -> Response {
    let body = Body::from_stream(ReceiverStream::new(stream).map(Ok::<_, Infallible>));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        // Hint reverse proxies not to buffer the event stream.
        .header(HeaderName::from_static("x-accel-buffering"), "no")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn error_response(err: &DispatchError) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    envelope_response(status, &err.to_envelope(), err.retry_after())
}

fn envelope_response(
    status: StatusCode,
    envelope: &ErrorEnvelope,
    retry_after: Option<Duration>,
) -> Response {
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(retry_after) = retry_after {
        builder = builder.header(header::RETRY_AFTER, retry_after.as_secs().max(1).to_string());
    }
    builder
        .body(Body::from(envelope.to_json_bytes()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_extraction_is_case_insensitive_and_trimmed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "bearer  ck-123 ".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("ck-123"));

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn forwarded_for_wins_over_peer_address() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(
            client_ip(&headers, Some(peer)).as_deref(),
            Some("203.0.113.9")
        );
        assert_eq!(
            client_ip(&HeaderMap::new(), Some(peer)).as_deref(),
            Some("127.0.0.1")
        );
    }

    #[test]
    fn rate_limited_errors_carry_retry_after_header() {
        let err = DispatchError::RateLimitedClient {
            axis: "key",
            retry_after: Duration::from_secs(17),
        };
        let response = error_response(&err);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("17")
        );
    }

    #[test]
    fn auth_errors_render_the_openai_envelope() {
        let response = error_response(&DispatchError::InvalidAuth);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            &HeaderValue::from_static("application/json")
        );
    }
}
