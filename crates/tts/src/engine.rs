//! Engine seam for speech synthesis back ends.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use alicia_core::config::{env_opt, env_or, env_u32, env_usize};
use alicia_core::{AliciaError, ErrorKind};

/// Failure modes across engines, mapped onto the bus error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine timeout after {0:?}")]
    Timeout(Duration),

    #[error("engine exited with status {status}: {stderr}")]
    NonzeroExit { status: i32, stderr: String },

    #[error("invalid engine output: {0}")]
    InvalidOutput(String),

    #[error("api error: {status} — {body}")]
    ApiError { status: u16, body: String },

    #[error("engine not configured: {0}")]
    NotConfigured(String),

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ApiError { .. } => ErrorKind::Transport,
            Self::NonzeroExit { .. } | Self::InvalidOutput(_) | Self::Io(_) => ErrorKind::Internal,
            Self::NotConfigured(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceInfo {
    pub name: String,
    pub engine: &'static str,
    pub status: &'static str,
}

/// A speech synthesis back end. Engine-agnostic at this seam, engine-aware
/// behind it.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Synthesize `text` into a WAV file at `output_path`.
    async fn synthesize(&self, text: &str, voice: &str, output_path: &Path)
        -> Result<(), EngineError>;

    fn voices(&self) -> Vec<VoiceInfo>;
}

// ── Configuration ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// `piper`, `google`, or `azure`.
    pub engine: String,
    pub voice_model: String,
    pub sample_rate: u32,
    pub max_text_length: usize,
    pub piper_bin: String,
    pub piper_model_dir: String,
    pub google_api_key: Option<String>,
    pub azure_speech_key: Option<String>,
    pub azure_region: String,
}

impl TtsConfig {
    pub fn from_env() -> Self {
        Self {
            engine: env_or("TTS_ENGINE", "piper"),
            voice_model: env_or("VOICE_MODEL", "en_US-lessac-medium"),
            sample_rate: env_u32("SAMPLE_RATE", 22050),
            max_text_length: env_usize("MAX_TEXT_LENGTH", 1000),
            piper_bin: env_or("PIPER_BIN", "piper"),
            piper_model_dir: env_or("PIPER_MODEL_DIR", "models/piper"),
            google_api_key: env_opt("GOOGLE_TTS_API_KEY"),
            azure_speech_key: env_opt("AZURE_SPEECH_KEY"),
            azure_region: env_or("AZURE_SPEECH_REGION", "eastus"),
        }
    }
}

/// Instantiate the configured engine.
pub fn create_engine(config: &TtsConfig) -> Result<Arc<dyn TtsEngine>, AliciaError> {
    match config.engine.as_str() {
        "piper" => Ok(Arc::new(crate::piper::PiperEngine::new(
            &config.piper_bin,
            &config.piper_model_dir,
            &config.voice_model,
        ))),
        "google" => {
            let api_key = config.google_api_key.clone().ok_or_else(|| {
                AliciaError::Internal("GOOGLE_TTS_API_KEY not configured".into())
            })?;
            Ok(Arc::new(crate::google::GoogleEngine::new(
                api_key,
                config.sample_rate,
            )))
        }
        "azure" => {
            let key = config.azure_speech_key.clone().ok_or_else(|| {
                AliciaError::Internal("AZURE_SPEECH_KEY not configured".into())
            })?;
            Ok(Arc::new(crate::azure::AzureEngine::new(
                key,
                config.azure_region.clone(),
            )))
        }
        other => Err(AliciaError::Validation(format!(
            "unsupported TTS engine: {other}"
        ))),
    }
}
