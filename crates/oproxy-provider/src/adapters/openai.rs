use bytes::Bytes;

use oproxy_protocol::chat::{ChatCompletion, ChatCompletionRequestBody};
use oproxy_protocol::completion::{Completion, CompletionRequestBody};
use oproxy_protocol::embedding::{EmbeddingRequestBody, EmbeddingResponse};

use crate::adapter::{Capability, ProviderAdapter};
use crate::adapters::{post_json, set_bearer, set_json_headers};
use crate::config::{ProviderEndpoint, ProviderKind};
use crate::errors::{ProviderError, ProviderResult};
use crate::http::UpstreamHttpRequest;
use crate::vault::UnsealedKey;

/// Passthrough dialect: the proxy speaks OpenAI on both sides, so requests
/// serialize unchanged (model already rewritten) and streams forward as-is.
#[derive(Debug, Default)]
pub struct OpenAIAdapter;

const CAPABILITIES: &[Capability] = &[
    Capability::ChatCompletion,
    Capability::Completion,
    Capability::Embedding,
    Capability::ListModels,
];

impl ProviderAdapter for OpenAIAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    fn build_chat(
        &self,
        endpoint: &ProviderEndpoint,
        secret: &UnsealedKey,
        req: &ChatCompletionRequestBody,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let body =
            serde_json::to_vec(req).map_err(|err| ProviderError::Other(err.to_string()))?;
        let mut headers = Vec::new();
        set_bearer(&mut headers, secret.expose());
        set_json_headers(&mut headers);
        Ok(post_json(
            endpoint.url("/v1/chat/completions"),
            headers,
            body,
            req.stream.unwrap_or(false),
        ))
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
        secret: &UnsealedKey,
        req: &CompletionRequestBody,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let body =
            serde_json::to_vec(req).map_err(|err| ProviderError::Other(err.to_string()))?;
        let mut headers = Vec::new();
        set_bearer(&mut headers, secret.expose());
        set_json_headers(&mut headers);
        Ok(post_json(
            endpoint.url("/v1/completions"),
            headers,
            body,
            req.stream.unwrap_or(false),
        ))
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
        secret: &UnsealedKey,
        req: &EmbeddingRequestBody,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let body =
            serde_json::to_vec(req).map_err(|err| ProviderError::Other(err.to_string()))?;
        let mut headers = Vec::new();
        set_bearer(&mut headers, secret.expose());
        set_json_headers(&mut headers);
        Ok(post_json(
            endpoint.url("/v1/embeddings"),
            headers,
            body,
            false,
        ))
    }

    fn decode_embedding(
        &self,
        _endpoint: &ProviderEndpoint,
        body: &Bytes,
    ) -> ProviderResult<EmbeddingResponse> {
        serde_json::from_slice(body).map_err(|err| ProviderError::DecodeResponse(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::header_get;
    use crate::vault::KeyVault;

    fn endpoint() -> ProviderEndpoint {
        ProviderEndpoint::from_record(
            1,
            "upstream-a",
            "openai",
            "https://api.openai.com",
            &serde_json::json!({}),
        )
        .unwrap()
    }

    fn secret() -> UnsealedKey {
        let vault = KeyVault::from_master_key(&"11".repeat(32)).unwrap();
        let sealed = vault.seal("sk-unit-test").unwrap();
        vault.unseal(&sealed).unwrap()
    }

    #[test]
    fn chat_request_passes_through_unknown_fields() {
        let req: ChatCompletionRequestBody = serde_json::from_value(serde_json::json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "Hi"}],
            "seed": 7,
        }))
        .unwrap();
        let upstream = OpenAIAdapter.build_chat(&endpoint(), &secret(), &req).unwrap();
        assert_eq!(upstream.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(
            header_get(&upstream.headers, "authorization"),
            Some("Bearer sk-unit-test")
        );
        let sent: serde_json::Value = serde_json::from_slice(&upstream.body.unwrap()).unwrap();
        assert_eq!(sent["seed"], 7);
        assert!(!upstream.is_stream);
    }

    #[test]
    fn encode_then_decode_is_identity_for_passthrough() {
        let raw = serde_json::json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "Hi"}],
            "temperature": 0.5,
            "logit_bias": {"1": 2},
        });
        let req: ChatCompletionRequestBody = serde_json::from_value(raw.clone()).unwrap();
        let upstream = OpenAIAdapter.build_chat(&endpoint(), &secret(), &req).unwrap();
        let sent: serde_json::Value = serde_json::from_slice(&upstream.body.unwrap()).unwrap();
        assert_eq!(sent, raw);
    }
}
