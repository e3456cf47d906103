//! Piper TTS via subprocess.
//!
//! Invocation: `piper --model <dir>/<voice>.onnx --output_file <path>` with
//! the text on stdin. The child is killed if it outlives the hard timeout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::engine::{EngineError, TtsEngine, VoiceInfo};

const SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PiperEngine {
    binary: String,
    model_dir: PathBuf,
    default_voice: String,
    timeout: Duration,
}

impl PiperEngine {
    pub fn new(binary: &str, model_dir: &str, default_voice: &str) -> Self {
        Self {
            binary: binary.to_string(),
            model_dir: PathBuf::from(model_dir),
            default_voice: default_voice.to_string(),
            timeout: SYNTHESIS_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl TtsEngine for PiperEngine {
    fn name(&self) -> &'static str {
        "piper"
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        output_path: &Path,
    ) -> Result<(), EngineError> {
        let model = self.model_dir.join(format!("{voice}.onnx"));
        debug!(voice = %voice, model = %model.display(), "piper synthesis");

        let mut child = Command::new(&self.binary)
            .arg("--model")
            .arg(&model)
            .arg("--output_file")
            .arg(output_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await?;
            drop(stdin);
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(EngineError::Timeout(self.timeout)),
        };

        if !output.status.success() {
            return Err(EngineError::NonzeroExit {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // A zero-byte or missing file means the engine silently failed.
        match tokio::fs::metadata(output_path).await {
            Ok(meta) if meta.len() > 0 => Ok(()),
            Ok(_) => Err(EngineError::InvalidOutput("empty audio file".into())),
            Err(_) => Err(EngineError::InvalidOutput("no audio file produced".into())),
        }
    }

    fn voices(&self) -> Vec<VoiceInfo> {
        vec![VoiceInfo {
            name: self.default_voice.clone(),
            engine: "piper",
            status: "available",
        }]
    }
}
