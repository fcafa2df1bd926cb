pub mod chat;
pub mod openai;

pub use chat::{ChatCompletionRequest, ChatMessage, ContentPart, MessageContent};
pub use openai::{ModelInfo, ModelsResponse, error_body};
