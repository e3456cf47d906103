//! Whisper transcription via subprocess.
//!
//! The audio is written to a temp file and the binary is invoked with the
//! transcript expected on stdout. Killed past the hard timeout.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::engine::{EngineError, SttEngine, Transcript};

const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WhisperEngine {
    binary: String,
    model: String,
    timeout: Duration,
}

impl WhisperEngine {
    pub fn new(binary: &str, model: &str) -> Self {
        Self {
            binary: binary.to_string(),
            model: model.to_string(),
            timeout: TRANSCRIBE_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl SttEngine for WhisperEngine {
    fn name(&self) -> &'static str {
        "whisper"
    }

    async fn transcribe(
        &self,
        audio: &[u8],
        language: Option<&str>,
    ) -> Result<Transcript, EngineError> {
        let audio_path = std::env::temp_dir().join(format!(
            "alicia_stt_{}.wav",
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::write(&audio_path, audio).await?;

        debug!(model = %self.model, bytes = audio.len(), "whisper transcription");
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--model")
            .arg(&self.model)
            .arg(&audio_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(lang) = language {
            cmd.arg("--language").arg(lang);
        }

        let child = cmd.spawn()?;
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = tokio::fs::remove_file(&audio_path).await;
                return Err(EngineError::Timeout(self.timeout));
            }
        };
        let _ = tokio::fs::remove_file(&audio_path).await;

        if !output.status.success() {
            return Err(EngineError::NonzeroExit {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Err(EngineError::InvalidOutput("empty transcript".into()));
        }

        Ok(Transcript {
            text,
            language: language.unwrap_or("en").to_string(),
            confidence: 1.0,
        })
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn fake_whisper(dir: &Path, body: &str) -> String {
        let path = dir.join("whisper");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn stdout_becomes_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_whisper(dir.path(), "echo 'turn on the kitchen light'");
        let engine = WhisperEngine::new(&binary, "base");

        let transcript = engine.transcribe(b"RIFFfake", Some("en")).await.unwrap();
        assert_eq!(transcript.text, "turn on the kitchen light");
        assert_eq!(transcript.language, "en");
    }

    #[tokio::test]
    async fn nonzero_exit_reported() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_whisper(dir.path(), "echo 'bad model' >&2\nexit 2");
        let engine = WhisperEngine::new(&binary, "base");

        let err = engine.transcribe(b"RIFFfake", None).await.unwrap_err();
        assert!(matches!(err, EngineError::NonzeroExit { status: 2, .. }));
    }

    #[tokio::test]
    async fn silent_output_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_whisper(dir.path(), "exit 0");
        let engine = WhisperEngine::new(&binary, "base");

        let err = engine.transcribe(b"RIFFfake", None).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidOutput(_)));
    }

    #[tokio::test]
    async fn hung_engine_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_whisper(dir.path(), "sleep 30");
        let engine =
            WhisperEngine::new(&binary, "base").with_timeout(Duration::from_millis(200));

        let err = engine.transcribe(b"RIFFfake", None).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }
}
