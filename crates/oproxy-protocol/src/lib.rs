pub mod chat;
pub mod completion;
pub mod embedding;
pub mod error;
pub mod models;
pub mod sse;

pub use error::{ErrorBody, ErrorEnvelope};

/// Token usage as reported by OpenAI-compatible upstreams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}
