use bytes::Bytes;
use serde::{Deserialize, Serialize};

use oproxy_protocol::Usage;
use oproxy_protocol::chat::request::StopConfiguration;
use oproxy_protocol::chat::{
    ChatChoice, ChatCompletion, ChatCompletionChunk, ChatCompletionRequestBody, ChatDelta,
    ChatMessage, FinishReason, Role,
};
use oproxy_protocol::sse::{SseDecoder, done_frame, encode_data};

use crate::adapter::{Capability, ProviderAdapter};
use crate::adapters::{now_unix, post_json, set_json_headers};
use crate::config::{KindOptions, ProviderEndpoint, ProviderKind};
use crate::errors::{ProviderError, ProviderResult};
use crate::http::{ByteStream, UpstreamHttpRequest, header_set};
use crate::vault::UnsealedKey;

const DEFAULT_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: i64 = 1024;

/// Anthropic Messages dialect. Requests are reshaped (system prompt is a
/// top-level field, `max_tokens` is mandatory), responses and SSE events are
/// rewritten back into the OpenAI chat shape.
#[derive(Debug, Default)]
pub struct AnthropicAdapter;

const CAPABILITIES: &[Capability] = &[Capability::ChatCompletion];

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: i64,
    messages: Vec<OutboundMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Serialize)]
struct OutboundMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    id: String,
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: MessagesUsage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default, Clone, Copy)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
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
        let (version, default_max_tokens) = match &endpoint.options {
            KindOptions::Anthropic(options) => (
                options.version.clone(),
                options.default_max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            ),
            _ => (None, DEFAULT_MAX_TOKENS),
        };

        let (system, messages) = split_messages(req);
        let outbound = MessagesRequest {
            model: &req.model,
            max_tokens: req.max_tokens.unwrap_or(default_max_tokens),
            messages,
            system,
            temperature: req.temperature,
            top_p: req.top_p,
            stop_sequences: req.stop.as_ref().map(stop_sequences),
            stream: req.stream,
        };
        let body =
            serde_json::to_vec(&outbound).map_err(|err| ProviderError::Other(err.to_string()))?;

        let mut headers = Vec::new();
        header_set(&mut headers, "x-api-key", secret.expose());
        header_set(
            &mut headers,
            "anthropic-version",
            version.as_deref().unwrap_or(DEFAULT_VERSION),
        );
        set_json_headers(&mut headers);
        Ok(post_json(
            endpoint.url("/v1/messages"),
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
        let resp: MessagesResponse = serde_json::from_slice(body)
            .map_err(|err| ProviderError::DecodeResponse(err.to_string()))?;
        let text = resp
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("");
        Ok(ChatCompletion {
            id: resp.id,
            object: "chat.completion".to_string(),
            created: now_unix(),
            model: resp.model,
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::assistant(text),
                finish_reason: Some(map_stop_reason(resp.stop_reason.as_deref())),
            }],
            usage: Some(usage_from(resp.usage)),
            extra: serde_json::Map::new(),
        })
    }

    fn adapt_chat_stream(&self, _endpoint: &ProviderEndpoint, upstream: ByteStream) -> ByteStream {
        translate_stream(upstream)
    }
}

fn split_messages(req: &ChatCompletionRequestBody) -> (Option<String>, Vec<OutboundMessage>) {
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();
    for message in &req.messages {
        let text = message
            .content
            .as_ref()
            .map(|content| content.joined_text())
            .unwrap_or_default();
        match message.role {
            Role::System | Role::Developer => system_parts.push(text),
            Role::Assistant => messages.push(OutboundMessage {
                role: "assistant",
                content: text,
            }),
            Role::User | Role::Tool => messages.push(OutboundMessage {
                role: "user",
                content: text,
            }),
        }
    }
    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n"))
    };
    (system, messages)
}

fn stop_sequences(stop: &StopConfiguration) -> Vec<String> {
    match stop {
        StopConfiguration::Single(seq) => vec![seq.clone()],
        StopConfiguration::Many(seqs) => seqs.clone(),
    }
}

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

fn usage_from(usage: MessagesUsage) -> Usage {
    Usage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.input_tokens + usage.output_tokens,
    }
}

/// Rewrite the Anthropic event stream into OpenAI chunk frames.
///
/// `message_start` opens the choice with a role delta, `content_block_delta`
/// carries text, `message_delta` brings stop_reason and output tokens, and
/// `message_stop` closes with a finish chunk and `[DONE]`. An upstream that
/// dies mid-message simply closes the channel; the dispatch engine's stream
/// guard owns the client-facing error frame in that case.
fn translate_stream(mut upstream: ByteStream) -> ByteStream {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut decoder = SseDecoder::new();
        let mut state = StreamState::default();

        while let Some(chunk) = upstream.recv().await {
            for frame in decoder.feed(&chunk) {
                match handle_frame(frame.event.as_deref().unwrap_or(""), &frame.data, &mut state) {
                    FrameAction::Emit(bytes) => {
                        for item in bytes {
                            if tx.send(item).await.is_err() {
                                return;
                            }
                        }
                    }
                    FrameAction::Finished(bytes) => {
                        for item in bytes {
                            if tx.send(item).await.is_err() {
                                return;
                            }
                        }
                        return;
                    }
                    FrameAction::Skip => {}
                }
            }
        }
    });
    rx
}

#[derive(Default)]
struct StreamState {
    id: String,
    model: String,
    created: i64,
    input_tokens: i64,
    output_tokens: i64,
    finish: Option<FinishReason>,
}

enum FrameAction {
    Emit(Vec<Bytes>),
    Finished(Vec<Bytes>),
    Skip,
}

fn handle_frame(event: &str, data: &str, state: &mut StreamState) -> FrameAction {
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(_) => return FrameAction::Skip,
    };
    match event {
        "message_start" => {
            let message = &value["message"];
            state.id = message["id"].as_str().unwrap_or("chatcmpl-stream").to_string();
            state.model = message["model"].as_str().unwrap_or_default().to_string();
            state.created = now_unix();
            state.input_tokens = message["usage"]["input_tokens"].as_i64().unwrap_or(0);
            let chunk = ChatCompletionChunk::delta(
                &state.id,
                state.created,
                &state.model,
                0,
                ChatDelta {
                    role: Some(Role::Assistant),
                    content: Some(String::new()),
                    extra: serde_json::Map::new(),
                },
            );
            FrameAction::Emit(encode_chunk(&chunk))
        }
        "content_block_delta" => {
            let Some(text) = value["delta"]["text"].as_str() else {
                return FrameAction::Skip;
            };
            let chunk = ChatCompletionChunk::delta(
                &state.id,
                state.created,
                &state.model,
                0,
                ChatDelta {
                    role: None,
                    content: Some(text.to_string()),
                    extra: serde_json::Map::new(),
                },
            );
            FrameAction::Emit(encode_chunk(&chunk))
        }
        "message_delta" => {
            if let Some(reason) = value["delta"]["stop_reason"].as_str() {
                state.finish = Some(map_stop_reason(Some(reason)));
            }
            if let Some(tokens) = value["usage"]["output_tokens"].as_i64() {
                state.output_tokens = tokens;
            }
            FrameAction::Skip
        }
        "message_stop" => {
            let mut chunk = ChatCompletionChunk::finish(
                &state.id,
                state.created,
                &state.model,
                state.finish.unwrap_or(FinishReason::Stop),
            );
            chunk.usage = Some(Usage {
                prompt_tokens: state.input_tokens,
                completion_tokens: state.output_tokens,
                total_tokens: state.input_tokens + state.output_tokens,
            });
            let mut frames = encode_chunk(&chunk);
            frames.push(done_frame());
            FrameAction::Finished(frames)
        }
        _ => FrameAction::Skip,
    }
}

fn encode_chunk(chunk: &ChatCompletionChunk) -> Vec<Bytes> {
    match serde_json::to_string(chunk) {
        Ok(json) => vec![encode_data(&json)],
        Err(_) => Vec::new(),
    }
}
