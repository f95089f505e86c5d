pub mod request;
pub mod response;
pub mod stream;

pub use request::{ChatCompletionRequestBody, MessageContent, StopConfiguration};
pub use response::{ChatChoice, ChatCompletion, ChatMessage, FinishReason, Role};
pub use stream::{ChatCompletionChunk, ChatDelta, ChunkChoice};
