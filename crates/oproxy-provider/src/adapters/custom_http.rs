use bytes::Bytes;

use oproxy_protocol::chat::{ChatCompletion, ChatCompletionRequestBody};
use oproxy_protocol::completion::{Completion, CompletionRequestBody};
use oproxy_protocol::embedding::{EmbeddingRequestBody, EmbeddingResponse};

use crate::adapter::{Capability, ProviderAdapter};
use crate::adapters::{post_json, set_bearer, set_json_headers};
use crate::config::{CustomHttpOptions, KindOptions, ProviderEndpoint, ProviderKind};
use crate::errors::{ProviderError, ProviderResult};
use crate::http::{UpstreamHttpRequest, header_set};
use crate::vault::UnsealedKey;

/// Any OpenAI-compatible endpoint that is not api.openai.com: self-hosted
/// gateways, vLLM, llama.cpp servers. Paths and the auth header are
/// configurable; the wire shape is assumed OpenAI.
#[derive(Debug, Default)]
pub struct CustomHttpAdapter;

const CAPABILITIES: &[Capability] = &[
    Capability::ChatCompletion,
    Capability::Completion,
    Capability::Embedding,
    Capability::ListModels,
];

fn options(endpoint: &ProviderEndpoint) -> CustomHttpOptions {
    match &endpoint.options {
        KindOptions::CustomHttp(options) => options.clone(),
        _ => CustomHttpOptions::default(),
    }
}

fn auth_headers(options: &CustomHttpOptions, secret: &UnsealedKey) -> crate::http::Headers {
    let mut headers = Vec::new();
    set_json_headers(&mut headers);
    match options.auth_header.as_deref() {
        Some(name) if !name.eq_ignore_ascii_case("authorization") => {
            header_set(&mut headers, name, secret.expose());
        }
        _ => set_bearer(&mut headers, secret.expose()),
    }
    headers
}

impl ProviderAdapter for CustomHttpAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CustomHttp
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
        let options = options(endpoint);
        let path = options
            .chat_path
            .as_deref()
            .unwrap_or("/v1/chat/completions");
        let body =
            serde_json::to_vec(req).map_err(|err| ProviderError::Other(err.to_string()))?;
        Ok(post_json(
            endpoint.url(path),
            auth_headers(&options, secret),
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
        let options = options(endpoint);
        let path = options.completions_path.as_deref().unwrap_or("/v1/completions");
        let body =
            serde_json::to_vec(req).map_err(|err| ProviderError::Other(err.to_string()))?;
        Ok(post_json(
            endpoint.url(path),
            auth_headers(&options, secret),
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
        let options = options(endpoint);
        let path = options.embeddings_path.as_deref().unwrap_or("/v1/embeddings");
        let body =
            serde_json::to_vec(req).map_err(|err| ProviderError::Other(err.to_string()))?;
        Ok(post_json(
            endpoint.url(path),
            auth_headers(&options, secret),
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

    fn endpoint(config: serde_json::Value) -> ProviderEndpoint {
        ProviderEndpoint::from_record(5, "gateway", "custom_http", "https://llm.internal", &config)
            .unwrap()
    }

    fn secret() -> UnsealedKey {
        let vault = KeyVault::from_master_key(&"55".repeat(32)).unwrap();
        let sealed = vault.seal("tok-9876").unwrap();
        vault.unseal(&sealed).unwrap()
    }

    #[test]
    fn custom_paths_and_auth_header_apply() {
        let endpoint = endpoint(serde_json::json!({
            "options": {"chat_path": "/openai/chat", "auth_header": "x-api-key"}
        }));
        let req: ChatCompletionRequestBody = serde_json::from_value(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "Hi"}],
        }))
        .unwrap();
        let upstream = CustomHttpAdapter
            .build_chat(&endpoint, &secret(), &req)
            .unwrap();
        assert_eq!(upstream.url, "https://llm.internal/openai/chat");
        assert_eq!(header_get(&upstream.headers, "x-api-key"), Some("tok-9876"));
        assert!(header_get(&upstream.headers, "authorization").is_none());
    }

    #[test]
    fn defaults_match_openai_paths() {
        let endpoint = endpoint(serde_json::json!({}));
        let req: EmbeddingRequestBody = serde_json::from_value(serde_json::json!({
            "model": "m",
            "input": "text",
        }))
        .unwrap();
        let upstream = CustomHttpAdapter
            .build_embedding(&endpoint, &secret(), &req)
            .unwrap();
        assert_eq!(upstream.url, "https://llm.internal/v1/embeddings");
        assert_eq!(
            header_get(&upstream.headers, "authorization"),
            Some("Bearer tok-9876")
        );
    }
}
