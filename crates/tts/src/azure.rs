//! Azure Speech synthesis over its REST surface.

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::engine::{EngineError, TtsEngine, VoiceInfo};

const DEFAULT_VOICE: &str = "en-US-AriaNeural";
const OUTPUT_FORMAT: &str = "riff-22050hz-16bit-mono-pcm";

pub struct AzureEngine {
    client: reqwest::Client,
    speech_key: String,
    region: String,
    endpoint_override: Option<String>,
}

impl AzureEngine {
    pub fn new(speech_key: String, region: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            speech_key,
            region,
            endpoint_override: None,
        }
    }

    fn endpoint(&self) -> String {
        self.endpoint_override.clone().unwrap_or_else(|| {
            format!(
                "https://{}.tts.speech.microsoft.com/cognitiveservices/v1",
                self.region
            )
        })
    }

    fn ssml(text: &str, voice: &str) -> String {
        let escaped = text
            .replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;");
        format!(
            "<speak version='1.0' xml:lang='en-US'><voice name='{voice}'>{escaped}</voice></speak>"
        )
    }
}

#[async_trait]
impl TtsEngine for AzureEngine {
    fn name(&self) -> &'static str {
        "azure"
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        output_path: &Path,
    ) -> Result<(), EngineError> {
        debug!(voice = %voice, region = %self.region, "azure synthesis request");
        let response = self
            .client
            .post(self.endpoint())
            .header("Ocp-Apim-Subscription-Key", &self.speech_key)
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", OUTPUT_FORMAT)
            .body(Self::ssml(text, voice))
            .send()
            .await
            .map_err(|e| EngineError::ApiError {
                status: 0,
                body: e.to_string(),
            })?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::ApiError { status, body });
        }

        let audio = response.bytes().await.map_err(|e| EngineError::ApiError {
            status: 200,
            body: e.to_string(),
        })?;
        if audio.is_empty() {
            return Err(EngineError::InvalidOutput("empty audio response".into()));
        }

        tokio::fs::write(output_path, &audio).await?;
        Ok(())
    }

    fn voices(&self) -> Vec<VoiceInfo> {
        vec![VoiceInfo {
            name: DEFAULT_VOICE.to_string(),
            engine: "azure",
            status: "available",
        }]
    }
}
