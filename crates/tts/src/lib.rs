pub mod api;
pub mod azure;
pub mod engine;
pub mod google;
pub mod piper;
pub mod service;

pub use engine::{create_engine, EngineError, TtsConfig, TtsEngine, VoiceInfo};
pub use service::TtsService;
