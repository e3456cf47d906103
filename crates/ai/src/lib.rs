pub mod provider;
pub mod service;

pub use provider::{AiConfig, BackendError, ChatBackend, ChatMessage, Completion, OpenAiBackend, Role};
pub use service::AiService;
