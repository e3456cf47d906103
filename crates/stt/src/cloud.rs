//! Cloud recognition back ends (Google and Azure) over their REST surfaces.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use tracing::debug;

use crate::engine::{EngineError, SttEngine, Transcript};

// ── Google ────────────────────────────────────────────────────────────────

pub struct GoogleSttEngine {
    client: reqwest::Client,
    api_key: String,
}

impl GoogleSttEngine {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

#[async_trait]
impl SttEngine for GoogleSttEngine {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn transcribe(
        &self,
        audio: &[u8],
        language: Option<&str>,
    ) -> Result<Transcript, EngineError> {
        let language = language.unwrap_or("en-US");
        let body = json!({
            "config": {
                "encoding": "LINEAR16",
                "languageCode": language,
            },
            "audio": {"content": BASE64.encode(audio)},
        });

        debug!(bytes = audio.len(), "google recognition request");
        let response = self
            .client
            .post(format!(
                "https://speech.googleapis.com/v1/speech:recognize?key={}",
                self.api_key
            ))
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
        let alternative = &parsed["results"][0]["alternatives"][0];
        let text = alternative["transcript"]
            .as_str()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| EngineError::InvalidOutput("no transcript in response".into()))?;

        Ok(Transcript {
            text: text.to_string(),
            language: language.to_string(),
            confidence: alternative["confidence"].as_f64().unwrap_or(0.0),
        })
    }
}

// ── Azure ─────────────────────────────────────────────────────────────────

pub struct AzureSttEngine {
    client: reqwest::Client,
    speech_key: String,
    region: String,
}

impl AzureSttEngine {
    pub fn new(speech_key: String, region: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            speech_key,
            region,
        }
    }
}

#[async_trait]
impl SttEngine for AzureSttEngine {
    fn name(&self) -> &'static str {
        "azure"
    }

    async fn transcribe(
        &self,
        audio: &[u8],
        language: Option<&str>,
    ) -> Result<Transcript, EngineError> {
        let language = language.unwrap_or("en-US");
        let url = format!(
            "https://{}.stt.speech.microsoft.com/speech/recognition/conversation/cognitiveservices/v1?language={}",
            self.region, language
        );

        debug!(bytes = audio.len(), region = %self.region, "azure recognition request");
        let response = self
            .client
            .post(url)
            .header("Ocp-Apim-Subscription-Key", &self.speech_key)
            .header("Content-Type", "audio/wav")
            .body(audio.to_vec())
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
        if parsed["RecognitionStatus"].as_str() != Some("Success") {
            return Err(EngineError::InvalidOutput(format!(
                "recognition status: {}",
                parsed["RecognitionStatus"]
            )));
        }
        let text = parsed["DisplayText"]
            .as_str()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| EngineError::InvalidOutput("no DisplayText in response".into()))?;

        Ok(Transcript {
            text: text.to_string(),
            language: language.to_string(),
            confidence: parsed["Confidence"].as_f64().unwrap_or(1.0),
        })
    }
}
