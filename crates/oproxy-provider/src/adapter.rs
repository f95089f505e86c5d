use bytes::Bytes;

use oproxy_protocol::chat::{ChatCompletion, ChatCompletionRequestBody};
use oproxy_protocol::completion::{Completion, CompletionRequestBody};
use oproxy_protocol::embedding::{EmbeddingRequestBody, EmbeddingResponse};

use crate::adapters;
use crate::config::{ProviderEndpoint, ProviderKind};
use crate::errors::{ProviderError, ProviderResult};
use crate::http::{ByteStream, UpstreamFailure, UpstreamHttpRequest};
use crate::outcome::{Outcome, classify_failure};
use crate::vault::UnsealedKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ChatCompletion,
    Completion,
    Embedding,
    ListModels,
}

/// One upstream dialect. Adapters are stateless request builders and
/// response normalizers; all IO happens in the upstream client. The engine
/// substitutes the provider-native model name into the body before calling
/// any build hook.
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> &'static [Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    fn build_chat(
        &self,
        _endpoint: &ProviderEndpoint,
        _secret: &UnsealedKey,
        _req: &ChatCompletionRequestBody,
    ) -> ProviderResult<UpstreamHttpRequest> {
        Err(ProviderError::Unsupported("chat_completion"))
    }

    fn decode_chat(
        &self,
        _endpoint: &ProviderEndpoint,
        _body: &Bytes,
    ) -> ProviderResult<ChatCompletion> {
        Err(ProviderError::Unsupported("chat_completion"))
    }

    fn build_completion(
        &self,
        _endpoint: &ProviderEndpoint,
        _secret: &UnsealedKey,
        _req: &CompletionRequestBody,
    ) -> ProviderResult<UpstreamHttpRequest> {
        Err(ProviderError::Unsupported("completion"))
    }

    fn decode_completion(
        &self,
        _endpoint: &ProviderEndpoint,
        _body: &Bytes,
    ) -> ProviderResult<Completion> {
        Err(ProviderError::Unsupported("completion"))
    }

    fn build_embedding(
        &self,
        _endpoint: &ProviderEndpoint,
        _secret: &UnsealedKey,
        _req: &EmbeddingRequestBody,
    ) -> ProviderResult<UpstreamHttpRequest> {
        Err(ProviderError::Unsupported("embedding"))
    }

    fn decode_embedding(
        &self,
        _endpoint: &ProviderEndpoint,
        _body: &Bytes,
    ) -> ProviderResult<EmbeddingResponse> {
        Err(ProviderError::Unsupported("embedding"))
    }

    /// Rewrite the upstream chat stream into OpenAI chunk frames terminated
    /// by `[DONE]`. Dialects that already speak OpenAI SSE pass through.
    fn adapt_chat_stream(&self, _endpoint: &ProviderEndpoint, upstream: ByteStream) -> ByteStream {
        upstream
    }

    /// Normalize an upstream failure; the default HTTP/transport mapping
    /// fits every current dialect.
    fn classify(&self, failure: &UpstreamFailure) -> Outcome {
        classify_failure(failure)
    }
}

/// The provider set is closed; adapters are stateless statics.
pub fn adapter_for(kind: ProviderKind) -> &'static dyn ProviderAdapter {
    match kind {
        ProviderKind::OpenAI => &adapters::openai::OpenAIAdapter,
        ProviderKind::Anthropic => &adapters::anthropic::AnthropicAdapter,
        ProviderKind::Ollama => &adapters::ollama::OllamaAdapter,
        ProviderKind::Mock => &adapters::mock::MockAdapter,
        ProviderKind::CustomHttp => &adapters::custom_http::CustomHttpAdapter,
    }
}
