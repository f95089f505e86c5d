use serde::{Deserialize, Serialize};

/// Client-visible error envelope in the OpenAI shape:
/// `{"error":{"message":...,"type":...,"param":...,"code":...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                message: message.into(),
                kind: kind.into(),
                param: None,
                code: None,
            },
        }
    }

    pub fn to_json_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| {
            br#"{"error":{"message":"internal error","type":"api_error"}}"#.to_vec()
        })
    }

    /// Best-effort extraction of the upstream error message from a raw body.
    ///
    /// Falls back to the raw text when the body is not the OpenAI envelope
    /// (anthropic nests the message the same way, ollama uses `{"error":...}`).
    pub fn message_from_upstream(body: &[u8]) -> Option<String> {
        let value: serde_json::Value = serde_json::from_slice(body).ok()?;
        if let Some(error) = value.get("error") {
            if let Some(message) = error.get("message").and_then(|m| m.as_str()) {
                return Some(message.to_string());
            }
            if let Some(message) = error.as_str() {
                return Some(message.to_string());
            }
        }
        value
            .get("message")
            .and_then(|m| m.as_str())
            .map(|m| m.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_with_type_field() {
        let envelope = ErrorEnvelope::new("invalid_request_error", "model not found");
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["error"]["type"], "invalid_request_error");
        assert_eq!(json["error"]["message"], "model not found");
        assert!(json["error"].get("param").is_none());
    }

    #[test]
    fn upstream_message_extraction_handles_common_shapes() {
        let openai = br#"{"error":{"message":"bad prompt","type":"invalid_request_error"}}"#;
        assert_eq!(
            ErrorEnvelope::message_from_upstream(openai).as_deref(),
            Some("bad prompt")
        );
        let ollama = br#"{"error":"model 'x' not found"}"#;
        assert_eq!(
            ErrorEnvelope::message_from_upstream(ollama).as_deref(),
            Some("model 'x' not found")
        );
        assert_eq!(ErrorEnvelope::message_from_upstream(b"not json"), None);
    }
}
