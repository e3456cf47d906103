//! Google Cloud Text-to-Speech over its REST surface.

use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use tracing::debug;

use crate::engine::{EngineError, TtsEngine, VoiceInfo};

const DEFAULT_ENDPOINT: &str = "https://texttospeech.googleapis.com/v1/text:synthesize";
const DEFAULT_VOICE: &str = "en-US-Neural2-D";

pub struct GoogleEngine {
    client: reqwest::Client,
    api_key: String,
    sample_rate: u32,
    endpoint: String,
}

impl GoogleEngine {
    pub fn new(api_key: String, sample_rate: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            sample_rate,
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }
}

#[async_trait]
impl TtsEngine for GoogleEngine {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        output_path: &Path,
    ) -> Result<(), EngineError> {
        let body = json!({
            "input": {"text": text},
            "voice": {"languageCode": "en-US", "name": voice},
            "audioConfig": {
                "audioEncoding": "LINEAR16",
                "sampleRateHertz": self.sample_rate,
            },
        });

        debug!(voice = %voice, "google synthesis request");
        let response = self
            .client
            .post(format!("{}?key={}", self.endpoint, self.api_key))
            .json(&body)
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

        let parsed: serde_json::Value =
            response.json().await.map_err(|e| EngineError::ApiError {
                status: 200,
                body: e.to_string(),
            })?;
        let audio_b64 = parsed["audioContent"]
            .as_str()
            .ok_or_else(|| EngineError::InvalidOutput("missing audioContent".into()))?;
        let audio = BASE64
            .decode(audio_b64)
            .map_err(|_| EngineError::InvalidOutput("audioContent is not base64".into()))?;
        if audio.is_empty() {
            return Err(EngineError::InvalidOutput("empty audioContent".into()));
        }

        tokio::fs::write(output_path, audio).await?;
        Ok(())
    }

    fn voices(&self) -> Vec<VoiceInfo> {
        vec![VoiceInfo {
            name: DEFAULT_VOICE.to_string(),
            engine: "google",
            status: "available",
        }]
    }
}
