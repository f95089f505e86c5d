use bytes::Bytes;
use serde::{Deserialize, Serialize};

use oproxy_protocol::Usage;
use oproxy_protocol::chat::{
    ChatChoice, ChatCompletion, ChatCompletionChunk, ChatCompletionRequestBody, ChatDelta,
    ChatMessage, FinishReason, Role,
};
use oproxy_protocol::completion::{Completion, CompletionChoice, CompletionRequestBody};
use oproxy_protocol::embedding::{EmbeddingRequestBody, EmbeddingResponse};
use oproxy_protocol::sse::{done_frame, encode_data};

use crate::adapter::{Capability, ProviderAdapter};
use crate::adapters::{now_unix, post_json, set_bearer, set_json_headers, synthesize_id};
use crate::config::{ProviderEndpoint, ProviderKind};
use crate::errors::{ProviderError, ProviderResult};
use crate::http::{ByteStream, UpstreamHttpRequest};
use crate::vault::UnsealedKey;

/// Ollama's native REST dialect (`/api/chat`, `/api/generate`, `/api/embed`).
/// Local daemons need no credential; the bearer header is only attached when
/// a non-empty secret is configured, for deployments behind an auth proxy.
#[derive(Debug, Default)]
pub struct OllamaAdapter;

const CAPABILITIES: &[Capability] = &[
    Capability::ChatCompletion,
    Capability::Completion,
    Capability::Embedding,
];

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<i64>,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    model: String,
    message: OllamaResponseMessage,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<i64>,
    #[serde(default)]
    eval_count: Option<i64>,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    model: String,
    #[serde(default)]
    response: String,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<i64>,
    #[serde(default)]
    eval_count: Option<i64>,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    model: String,
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    prompt_eval_count: Option<i64>,
}

impl ProviderAdapter for OllamaAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
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
        let outbound = OllamaChatRequest {
            model: &req.model,
            messages: req
                .messages
                .iter()
                .map(|message| OllamaMessage {
                    role: role_tag(message).to_string(),
                    content: message
                        .content
                        .as_ref()
                        .map(|content| content.joined_text())
                        .unwrap_or_default(),
                })
                .collect(),
            stream: req.stream.unwrap_or(false),
            options: chat_options(req),
        };
        let body =
            serde_json::to_vec(&outbound).map_err(|err| ProviderError::Other(err.to_string()))?;
        Ok(post_json(
            endpoint.url("/api/chat"),
            base_headers(secret),
            body,
            req.stream.unwrap_or(false),
        ))
    }

    fn decode_chat(
        &self,
        _endpoint: &ProviderEndpoint,
        body: &Bytes,
    ) -> ProviderResult<ChatCompletion> {
        let resp: OllamaChatResponse = serde_json::from_slice(body)
            .map_err(|err| ProviderError::DecodeResponse(err.to_string()))?;
        Ok(ChatCompletion {
            id: synthesize_id("chatcmpl"),
            object: "chat.completion".to_string(),
            created: now_unix(),
            model: resp.model,
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::assistant(resp.message.content),
                finish_reason: Some(map_done_reason(resp.done_reason.as_deref())),
            }],
            usage: Some(usage_from(resp.prompt_eval_count, resp.eval_count)),
            extra: serde_json::Map::new(),
        })
    }

    fn build_completion(
        &self,
        endpoint: &ProviderEndpoint,
        secret: &UnsealedKey,
        req: &CompletionRequestBody,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let outbound = serde_json::json!({
            "model": req.model,
            "prompt": req.prompt.first(),
            "stream": false,
            "options": {
                "temperature": req.temperature,
                "top_p": req.top_p,
                "num_predict": req.max_tokens,
            },
        });
        let body =
            serde_json::to_vec(&outbound).map_err(|err| ProviderError::Other(err.to_string()))?;
        Ok(post_json(
            endpoint.url("/api/generate"),
            base_headers(secret),
            body,
            false,
        ))
    }

    fn decode_completion(
        &self,
        _endpoint: &ProviderEndpoint,
        body: &Bytes,
    ) -> ProviderResult<Completion> {
        let resp: OllamaGenerateResponse = serde_json::from_slice(body)
            .map_err(|err| ProviderError::DecodeResponse(err.to_string()))?;
        Ok(Completion {
            id: synthesize_id("cmpl"),
            object: "text_completion".to_string(),
            created: now_unix(),
            model: resp.model,
            choices: vec![CompletionChoice {
                text: resp.response,
                index: 0,
                finish_reason: Some(map_done_reason(resp.done_reason.as_deref())),
            }],
            usage: Some(usage_from(resp.prompt_eval_count, resp.eval_count)),
            extra: serde_json::Map::new(),
        })
    }

    fn build_embedding(
        &self,
        endpoint: &ProviderEndpoint,
        secret: &UnsealedKey,
        req: &EmbeddingRequestBody,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let outbound = serde_json::json!({
            "model": req.model,
            "input": req.input.texts(),
        });
        let body =
            serde_json::to_vec(&outbound).map_err(|err| ProviderError::Other(err.to_string()))?;
        Ok(post_json(
            endpoint.url("/api/embed"),
            base_headers(secret),
            body,
            false,
        ))
    }

    fn decode_embedding(
        &self,
        _endpoint: &ProviderEndpoint,
        body: &Bytes,
    ) -> ProviderResult<EmbeddingResponse> {
        let resp: OllamaEmbedResponse = serde_json::from_slice(body)
            .map_err(|err| ProviderError::DecodeResponse(err.to_string()))?;
        let usage = resp.prompt_eval_count.map(|prompt| Usage {
            prompt_tokens: prompt,
            completion_tokens: 0,
            total_tokens: prompt,
        });
        Ok(EmbeddingResponse::new(resp.model, resp.embeddings, usage))
    }

    /// Ollama streams NDJSON objects, one per line, not SSE.
    fn adapt_chat_stream(&self, _endpoint: &ProviderEndpoint, upstream: ByteStream) -> ByteStream {
        translate_ndjson_stream(upstream)
    }
}

fn base_headers(secret: &UnsealedKey) -> crate::http::Headers {
    let mut headers = Vec::new();
    set_json_headers(&mut headers);
    if !secret.expose().is_empty() {
        set_bearer(&mut headers, secret.expose());
    }
    headers
}

fn role_tag(message: &ChatMessage) -> &'static str {
    match message.role {
        Role::System | Role::Developer => "system",
        Role::Assistant => "assistant",
        Role::User | Role::Tool => "user",
    }
}

fn chat_options(req: &ChatCompletionRequestBody) -> Option<OllamaOptions> {
    if req.temperature.is_none() && req.top_p.is_none() && req.max_tokens.is_none() {
        return None;
    }
    Some(OllamaOptions {
        temperature: req.temperature,
        top_p: req.top_p,
        num_predict: req.max_tokens,
    })
}

fn map_done_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("length") => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

fn usage_from(prompt: Option<i64>, completion: Option<i64>) -> Usage {
    let prompt = prompt.unwrap_or(0);
    let completion = completion.unwrap_or(0);
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
    }
}

fn translate_ndjson_stream(mut upstream: ByteStream) -> ByteStream {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let id = synthesize_id("chatcmpl");
        let created = now_unix();
        let mut buffer = String::new();
        let mut sent_role = false;

        while let Some(chunk) = upstream.recv().await {
            let Ok(text) = std::str::from_utf8(&chunk) else {
                continue;
            };
            buffer.push_str(text);
            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Ok(resp) = serde_json::from_str::<OllamaStreamLine>(line) else {
                    continue;
                };
                if !sent_role {
                    sent_role = true;
                    let chunk = ChatCompletionChunk::delta(
                        &id,
                        created,
                        &resp.model,
                        0,
                        ChatDelta {
                            role: Some(Role::Assistant),
                            content: Some(String::new()),
                            extra: serde_json::Map::new(),
                        },
                    );
                    if send_chunk(&tx, &chunk).await.is_err() {
                        return;
                    }
                }
                if resp.done {
                    let mut finish = ChatCompletionChunk::finish(
                        &id,
                        created,
                        &resp.model,
                        map_done_reason(resp.done_reason.as_deref()),
                    );
                    finish.usage =
                        Some(usage_from(resp.prompt_eval_count, resp.eval_count));
                    if send_chunk(&tx, &finish).await.is_err() {
                        return;
                    }
                    let _ = tx.send(done_frame()).await;
                    return;
                }
                if let Some(content) = resp.message.map(|message| message.content)
                    && !content.is_empty()
                {
                    let chunk = ChatCompletionChunk::delta(
                        &id,
                        created,
                        &resp.model,
                        0,
                        ChatDelta {
                            role: None,
                            content: Some(content),
                            extra: serde_json::Map::new(),
                        },
                    );
                    if send_chunk(&tx, &chunk).await.is_err() {
                        return;
                    }
                }
            }
        }
        // Upstream closed before done: leave the channel without [DONE] so
        // the engine's stream guard surfaces the error to the client.
    });
    rx
}

#[derive(Deserialize)]
struct OllamaStreamLine {
    #[serde(default)]
    model: String,
    #[serde(default)]
    message: Option<OllamaResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<i64>,
    #[serde(default)]
    eval_count: Option<i64>,
}

async fn send_chunk(
    tx: &tokio::sync::mpsc::Sender<Bytes>,
    chunk: &ChatCompletionChunk,
) -> Result<(), ()> {
    let Ok(json) = serde_json::to_string(chunk) else {
        return Ok(());
    };
    tx.send(encode_data(&json)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::KeyVault;

    fn endpoint() -> ProviderEndpoint {
        ProviderEndpoint::from_record(
            3,
            "local-ollama",
            "ollama",
            "http://127.0.0.1:11434",
            &serde_json::json!({}),
        )
        .unwrap()
    }

    fn secret(cleartext: &str) -> UnsealedKey {
        let vault = KeyVault::from_master_key(&"33".repeat(32)).unwrap();
        let sealed = vault.seal(cleartext).unwrap();
        vault.unseal(&sealed).unwrap()
    }

    #[test]
    fn empty_secret_sends_no_auth_header() {
        let req: ChatCompletionRequestBody = serde_json::from_value(serde_json::json!({
            "model": "llama3",
            "messages": [{"role": "user", "content": "Hi"}],
        }))
        .unwrap();
        let upstream = OllamaAdapter
            .build_chat(&endpoint(), &secret(""), &req)
            .unwrap();
        assert_eq!(upstream.url, "http://127.0.0.1:11434/api/chat");
        assert!(crate::http::header_get(&upstream.headers, "authorization").is_none());
    }

    #[test]
    fn chat_response_maps_eval_counts_to_usage() {
        let body = Bytes::from(
            serde_json::json!({
                "model": "llama3",
                "message": {"role": "assistant", "content": "Hey"},
                "done": true,
                "done_reason": "stop",
                "prompt_eval_count": 12,
                "eval_count": 3,
            })
            .to_string(),
        );
        let completion = OllamaAdapter.decode_chat(&endpoint(), &body).unwrap();
        assert_eq!(completion.usage.unwrap().total_tokens, 15);
        assert_eq!(completion.choices[0].finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn ndjson_stream_becomes_openai_chunks() {
        let (tx, upstream) = tokio::sync::mpsc::channel::<Bytes>(8);
        let mut translated = translate_ndjson_stream(upstream);

        let lines = concat!(
            "{\"model\":\"llama3\",\"message\":{\"content\":\"He\"},\"done\":false}\n",
            "{\"model\":\"llama3\",\"message\":{\"content\":\"y\"},\"done\":false}\n",
            "{\"model\":\"llama3\",\"done\":true,\"done_reason\":\"stop\",\"prompt_eval_count\":5,\"eval_count\":2}\n",
        );
        tx.send(Bytes::from_static(lines.as_bytes())).await.unwrap();
        drop(tx);

        let mut frames = Vec::new();
        while let Some(frame) = translated.recv().await {
            frames.push(String::from_utf8(frame.to_vec()).unwrap());
        }
        // role + two content chunks + finish + [DONE]
        assert_eq!(frames.len(), 5);
        assert!(frames[1].contains("\"content\":\"He\""));
        assert!(frames[3].contains("\"finish_reason\":\"stop\""));
        assert!(frames[4].contains("[DONE]"));
    }
}
