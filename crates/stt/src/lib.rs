pub mod cloud;
pub mod engine;
pub mod service;
pub mod whisper;

pub use engine::{create_engine, EngineError, SttConfig, SttEngine, Transcript};
pub use service::SttService;
