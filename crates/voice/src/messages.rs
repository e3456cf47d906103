//! Typed payloads for the voice pipeline topics.
//!
//! Every job carries a `session_id` threading one utterance through
//! STT → AI → TTS → delivery. Payloads travel inside the bus envelope's
//! opaque `payload` field and are decoded at the handler boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Fresh correlation id for a new utterance.
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

// ── STT ───────────────────────────────────────────────────────────────────

/// A transcription job: raw audio inline or fetchable by URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SttJob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    /// Language hint for the engine (e.g. "en").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SttResult {
    pub text: String,
    pub language: String,
    pub confidence: f64,
    pub stt_time_ms: u64,
    pub engine: String,
    pub session_id: String,
}

// ── AI ────────────────────────────────────────────────────────────────────

/// A reasoning job: the transcript plus optional conversation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiJob {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiResult {
    pub response: String,
    pub tokens_used: u64,
    pub model: String,
    pub ai_time_ms: u64,
    pub session_id: String,
}

// ── TTS ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsJob {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsResult {
    pub success: bool,
    pub engine: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    /// Server-local path for intra-host pickup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<String>,
    /// Base64 audio, on request only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_base64: Option<String>,
    pub processing_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub session_id: String,
}
