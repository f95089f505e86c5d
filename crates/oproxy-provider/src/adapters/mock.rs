use bytes::Bytes;

use oproxy_protocol::Usage;
use oproxy_protocol::chat::{
    ChatChoice, ChatCompletion, ChatCompletionChunk, ChatCompletionRequestBody, ChatDelta,
    ChatMessage, FinishReason, Role,
};
use oproxy_protocol::completion::{Completion, CompletionChoice, CompletionRequestBody};
use oproxy_protocol::embedding::{EmbeddingRequestBody, EmbeddingResponse};
use oproxy_protocol::sse::{done_frame, encode_data};

use crate::adapter::{Capability, ProviderAdapter};
use crate::adapters::{now_unix, set_json_headers, synthesize_id};
use crate::config::{KindOptions, ProviderEndpoint, ProviderKind};
use crate::errors::{ProviderError, ProviderResult};
use crate::http::{HttpMethod, UpstreamHttpRequest};
use crate::vault::UnsealedKey;

const DEFAULT_REPLY: &str = "This is a mock response.";
const DEFAULT_EMBEDDING_DIM: usize = 8;

/// Deterministic in-process provider for smoke tests and local development.
/// Requests target `local://` URLs, which the upstream client echoes back,
/// so the canned response is produced here at build time.
#[derive(Debug, Default)]
pub struct MockAdapter;

const CAPABILITIES: &[Capability] = &[
    Capability::ChatCompletion,
    Capability::Completion,
    Capability::Embedding,
    Capability::ListModels,
];

impl ProviderAdapter for MockAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Mock
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    fn build_chat(
        &self,
        endpoint: &ProviderEndpoint,
        _secret: &UnsealedKey,
        req: &ChatCompletionRequestBody,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let reply = reply_text(endpoint);
        let stream = req.stream.unwrap_or(false);
        let body = if stream {
            stream_body(&req.model, &reply)
        } else {
            let completion = canned_completion(&req.model, &reply);
            serde_json::to_vec(&completion)
                .map_err(|err| ProviderError::Other(err.to_string()))?
        };
        Ok(local_request(body, stream))
    }

    fn decode_chat(
        &self,
        _endpoint: &ProviderEndpoint,
        body: &Bytes,
    ) -> ProviderResult<ChatCompletion> {
        serde_json::from_slice(body).map_err(|err| ProviderError::DecodeResponse(err.to_string()))
    }

    fn build_completion(
        &self,
        endpoint: &ProviderEndpoint,
        _secret: &UnsealedKey,
        req: &CompletionRequestBody,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let completion = Completion {
            id: synthesize_id("cmpl"),
            object: "text_completion".to_string(),
            created: now_unix(),
            model: req.model.clone(),
            choices: vec![CompletionChoice {
                text: reply_text(endpoint),
                index: 0,
                finish_reason: Some(FinishReason::Stop),
            }],
            usage: Some(mock_usage()),
            extra: serde_json::Map::new(),
        };
        let body = serde_json::to_vec(&completion)
            .map_err(|err| ProviderError::Other(err.to_string()))?;
        Ok(local_request(body, false))
    }

    fn decode_completion(
        &self,
        _endpoint: &ProviderEndpoint,
        body: &Bytes,
    ) -> ProviderResult<Completion> {
        serde_json::from_slice(body).map_err(|err| ProviderError::DecodeResponse(err.to_string()))
    }

    fn build_embedding(
        &self,
        endpoint: &ProviderEndpoint,
        _secret: &UnsealedKey,
        req: &EmbeddingRequestBody,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let dim = match &endpoint.options {
            KindOptions::Mock(options) => options.embedding_dim.unwrap_or(DEFAULT_EMBEDDING_DIM),
            _ => DEFAULT_EMBEDDING_DIM,
        };
        let vectors = req
            .input
            .texts()
            .iter()
            .map(|text| pseudo_embedding(text, dim))
            .collect();
        let response = EmbeddingResponse::new(req.model.clone(), vectors, Some(mock_usage()));
        let body =
            serde_json::to_vec(&response).map_err(|err| ProviderError::Other(err.to_string()))?;
        Ok(local_request(body, false))
    }

    fn decode_embedding(
        &self,
        _endpoint: &ProviderEndpoint,
        body: &Bytes,
    ) -> ProviderResult<EmbeddingResponse> {
        serde_json::from_slice(body).map_err(|err| ProviderError::DecodeResponse(err.to_string()))
    }
}

fn reply_text(endpoint: &ProviderEndpoint) -> String {
    match &endpoint.options {
        KindOptions::Mock(options) => options
            .reply
            .clone()
            .unwrap_or_else(|| DEFAULT_REPLY.to_string()),
        _ => DEFAULT_REPLY.to_string(),
    }
}

fn local_request(body: Vec<u8>, is_stream: bool) -> UpstreamHttpRequest {
    let mut headers = Vec::new();
    set_json_headers(&mut headers);
    UpstreamHttpRequest {
        method: HttpMethod::Post,
        url: "local://mock".to_string(),
        headers,
        body: Some(Bytes::from(body)),
        is_stream,
    }
}

fn canned_completion(model: &str, reply: &str) -> ChatCompletion {
    ChatCompletion {
        id: synthesize_id("chatcmpl"),
        object: "chat.completion".to_string(),
        created: now_unix(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::assistant(reply),
            finish_reason: Some(FinishReason::Stop),
        }],
        usage: Some(mock_usage()),
        extra: serde_json::Map::new(),
    }
}

/// Pre-rendered SSE body: role delta, one content delta, finish, `[DONE]`.
fn stream_body(model: &str, reply: &str) -> Vec<u8> {
    let id = synthesize_id("chatcmpl");
    let created = now_unix();
    let mut out = Vec::new();
    let chunks = [
        ChatCompletionChunk::delta(
            &id,
            created,
            model,
            0,
            ChatDelta {
                role: Some(Role::Assistant),
                content: Some(String::new()),
                extra: serde_json::Map::new(),
            },
        ),
        ChatCompletionChunk::delta(
            &id,
            created,
            model,
            0,
            ChatDelta {
                role: None,
                content: Some(reply.to_string()),
                extra: serde_json::Map::new(),
            },
        ),
        ChatCompletionChunk::finish(&id, created, model, FinishReason::Stop),
    ];
    for chunk in &chunks {
        if let Ok(json) = serde_json::to_string(chunk) {
            out.extend_from_slice(&encode_data(&json));
        }
    }
    out.extend_from_slice(&done_frame());
    out
}

fn mock_usage() -> Usage {
    Usage {
        prompt_tokens: 1,
        completion_tokens: 1,
        total_tokens: 2,
    }
}

/// Stable per-text vector so repeated calls compare equal in tests.
fn pseudo_embedding(text: &str, dim: usize) -> Vec<f32> {
    let mut seed = 0u64;
    for byte in text.bytes() {
        seed = seed.wrapping_mul(31).wrapping_add(byte as u64);
    }
    (0..dim)
        .map(|i| {
            let value = seed.wrapping_add(i as u64).wrapping_mul(2654435761) % 1000;
            value as f32 / 1000.0
        })
        .collect()
}
