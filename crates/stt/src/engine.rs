//! Engine seam for speech recognition back ends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use alicia_core::config::{env_opt, env_or};
use alicia_core::{AliciaError, ErrorKind};

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

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ApiError { .. } => ErrorKind::Transport,
            _ => ErrorKind::Internal,
        }
    }
}

/// A recognized utterance.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub language: String,
    pub confidence: f64,
}

/// A speech recognition back end.
#[async_trait]
pub trait SttEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Transcribe WAV audio bytes, optionally hinted with a language code.
    async fn transcribe(&self, audio: &[u8], language: Option<&str>)
        -> Result<Transcript, EngineError>;
}

// ── Configuration ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SttConfig {
    /// `whisper`, `google`, or `azure`.
    pub engine: String,
    pub whisper_bin: String,
    pub whisper_model: String,
    pub google_api_key: Option<String>,
    pub azure_speech_key: Option<String>,
    pub azure_region: String,
}

impl SttConfig {
    pub fn from_env() -> Self {
        Self {
            engine: env_or("STT_ENGINE", "whisper"),
            whisper_bin: env_or("WHISPER_BIN", "whisper"),
            whisper_model: env_or("WHISPER_MODEL", "base"),
            google_api_key: env_opt("GOOGLE_STT_API_KEY"),
            azure_speech_key: env_opt("AZURE_SPEECH_KEY"),
            azure_region: env_or("AZURE_SPEECH_REGION", "eastus"),
        }
    }
}

pub fn create_engine(config: &SttConfig) -> Result<Arc<dyn SttEngine>, AliciaError> {
    match config.engine.as_str() {
        "whisper" => Ok(Arc::new(crate::whisper::WhisperEngine::new(
            &config.whisper_bin,
            &config.whisper_model,
        ))),
        "google" => {
            let api_key = config.google_api_key.clone().ok_or_else(|| {
                AliciaError::Internal("GOOGLE_STT_API_KEY not configured".into())
            })?;
            Ok(Arc::new(crate::cloud::GoogleSttEngine::new(api_key)))
        }
        "azure" => {
            let key = config.azure_speech_key.clone().ok_or_else(|| {
                AliciaError::Internal("AZURE_SPEECH_KEY not configured".into())
            })?;
            Ok(Arc::new(crate::cloud::AzureSttEngine::new(
                key,
                config.azure_region.clone(),
            )))
        }
        other => Err(AliciaError::Validation(format!(
            "unsupported STT engine: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_engine_rejected() {
        let mut config = SttConfig::from_env();
        config.engine = "dragon".into();
        assert!(matches!(
            create_engine(&config),
            Err(AliciaError::Validation(_))
        ));
    }

    #[test]
    fn error_kind_mapping() {
        assert_eq!(
            EngineError::Timeout(Duration::from_secs(30)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            EngineError::ApiError {
                status: 429,
                body: "slow down".into()
            }
            .kind(),
            ErrorKind::Transport
        );
    }
}
