use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use oproxy_protocol::chat::ChatCompletionRequestBody;
use oproxy_protocol::completion::CompletionRequestBody;

use crate::errors::{ProviderError, ProviderResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
    Ollama,
    Mock,
    CustomHttp,
}

impl ProviderKind {
    pub fn parse(tag: &str) -> ProviderResult<Self> {
        match tag {
            "openai" => Ok(ProviderKind::OpenAI),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "ollama" => Ok(ProviderKind::Ollama),
            "mock" => Ok(ProviderKind::Mock),
            "custom_http" | "custom-http" => Ok(ProviderKind::CustomHttp),
            other => Err(ProviderError::InvalidConfig(format!(
                "unknown provider kind `{other}`"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Mock => "mock",
            ProviderKind::CustomHttp => "custom_http",
        }
    }
}

/// Closed provider config document stored in `providers.config_json`.
/// Unknown keys are rejected at admin ingest, not at dispatch time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfigDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Kind-specific options, themselves a closed schema per kind.
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub options: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderSettings {
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_retries: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnthropicOptions {
    /// `anthropic-version` header; a sane default is applied when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Default `max_tokens` when the client omits it (the upstream requires one).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_max_tokens: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_dim: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomHttpOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completions_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeddings_path: Option<String>,
    /// Header carrying the credential; defaults to `authorization: Bearer`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_header: Option<String>,
}

#[derive(Debug, Clone)]
pub enum KindOptions {
    OpenAI,
    Anthropic(AnthropicOptions),
    Ollama,
    Mock(MockOptions),
    CustomHttp(CustomHttpOptions),
}

impl KindOptions {
    fn parse(kind: ProviderKind, options: &JsonValue) -> ProviderResult<Self> {
        let options = if options.is_null() {
            JsonValue::Object(serde_json::Map::new())
        } else {
            options.clone()
        };
        let invalid = |err: serde_json::Error| {
            ProviderError::InvalidConfig(format!("provider options: {err}"))
        };
        Ok(match kind {
            ProviderKind::OpenAI => KindOptions::OpenAI,
            ProviderKind::Anthropic => {
                KindOptions::Anthropic(serde_json::from_value(options).map_err(invalid)?)
            }
            ProviderKind::Ollama => KindOptions::Ollama,
            ProviderKind::Mock => {
                KindOptions::Mock(serde_json::from_value(options).map_err(invalid)?)
            }
            ProviderKind::CustomHttp => {
                KindOptions::CustomHttp(serde_json::from_value(options).map_err(invalid)?)
            }
        })
    }
}

/// Runtime view of one provider record, resolved once per snapshot refresh.
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub provider_id: i64,
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub settings: ProviderSettings,
    pub options: KindOptions,
}

impl ProviderEndpoint {
    pub fn from_record(
        provider_id: i64,
        name: &str,
        kind_tag: &str,
        base_url: &str,
        config_json: &JsonValue,
    ) -> ProviderResult<Self> {
        let kind = ProviderKind::parse(kind_tag)?;
        let doc: ProviderConfigDoc = serde_json::from_value(config_json.clone())
            .map_err(|err| ProviderError::InvalidConfig(format!("provider config: {err}")))?;
        let defaults = ProviderSettings::default();
        let settings = ProviderSettings {
            timeout: doc
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            max_retries: doc.max_retries.unwrap_or(defaults.max_retries),
        };
        let options = KindOptions::parse(kind, &doc.options)?;
        Ok(Self {
            provider_id,
            name: name.to_string(),
            kind,
            base_url: base_url.trim_end_matches('/').to_string(),
            settings,
            options,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// Per-mapping request overrides. Client values win on conflict unless the
/// mapping marks the override as forced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(default)]
    pub forced: bool,
}

impl MappingOverride {
    pub fn from_json(value: &JsonValue) -> ProviderResult<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
            .map_err(|err| ProviderError::InvalidConfig(format!("mapping override: {err}")))
    }

    pub fn apply_chat(&self, body: &mut ChatCompletionRequestBody) {
        merge(&mut body.temperature, self.temperature, self.forced);
        merge(&mut body.top_p, self.top_p, self.forced);
        merge(&mut body.max_tokens, self.max_tokens, self.forced);
    }

    pub fn apply_completion(&self, body: &mut CompletionRequestBody) {
        merge(&mut body.temperature, self.temperature, self.forced);
        merge(&mut body.top_p, self.top_p, self.forced);
        merge(&mut body.max_tokens, self.max_tokens, self.forced);
    }
}

fn merge<T: Copy>(slot: &mut Option<T>, value: Option<T>, forced: bool) {
    if let Some(value) = value
        && (forced || slot.is_none())
    {
        *slot = Some(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_config_keys_are_rejected() {
        let config = serde_json::json!({"timeout_ms": 5000, "retries": 3});
        let err = ProviderEndpoint::from_record(1, "a", "openai", "https://x", &config);
        assert!(err.is_err());
    }

    #[test]
    fn kind_options_are_closed_per_kind() {
        let config = serde_json::json!({"options": {"version": "2023-06-01"}});
        assert!(ProviderEndpoint::from_record(1, "a", "anthropic", "https://x", &config).is_ok());
        assert!(ProviderEndpoint::from_record(1, "a", "mock", "local://", &config).is_err());
    }

    #[test]
    fn override_client_wins_unless_forced() {
        let mut body: ChatCompletionRequestBody = serde_json::from_value(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.9,
        }))
        .unwrap();

        let soft = MappingOverride {
            temperature: Some(0.1),
            max_tokens: Some(256),
            ..Default::default()
        };
        soft.apply_chat(&mut body);
        assert_eq!(body.temperature, Some(0.9));
        assert_eq!(body.max_tokens, Some(256));

        let forced = MappingOverride {
            temperature: Some(0.1),
            forced: true,
            ..Default::default()
        };
        forced.apply_chat(&mut body);
        assert_eq!(body.temperature, Some(0.1));
    }
}
