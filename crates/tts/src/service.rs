//! TTS orchestration: bounded work queue, single synthesis worker, and
//! bus delivery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use alicia_bus::runtime::ServiceRuntime;
use alicia_bus::traits::handler;
use alicia_bus::{topics, Envelope, QosLevel};
use alicia_core::{epoch_secs, AliciaError, ErrorKind};
use alicia_voice::{new_session_id, AiResult, TtsJob, TtsResult};

use crate::engine::{TtsConfig, TtsEngine, VoiceInfo};

/// Bound on queued synthesis jobs; HTTP callers get 503 past this.
const QUEUE_CAPACITY: usize = 32;

enum JobReply {
    Http(oneshot::Sender<TtsResult>),
    Bus,
}

struct Job {
    request: TtsJob,
    want_base64: bool,
    reply: JobReply,
}

pub struct TtsService {
    runtime: Arc<ServiceRuntime>,
    engine: Arc<dyn TtsEngine>,
    config: TtsConfig,
    job_tx: mpsc::Sender<Job>,
    queue_depth: Arc<AtomicUsize>,
}

impl TtsService {
    /// Wire the engine to the bus and start the synthesis worker.
    pub async fn start(
        runtime: Arc<ServiceRuntime>,
        config: TtsConfig,
        engine: Arc<dyn TtsEngine>,
    ) -> Result<Arc<Self>, AliciaError> {
        let (job_tx, job_rx) = mpsc::channel(QUEUE_CAPACITY);
        let service = Arc::new(Self {
            runtime: Arc::clone(&runtime),
            engine,
            config,
            job_tx,
            queue_depth: Arc::new(AtomicUsize::new(0)),
        });

        tokio::spawn(worker(Arc::clone(&service), job_rx));

        let svc = Arc::clone(&service);
        runtime
            .subscribe(
                topics::TTS_REQUEST,
                QosLevel::AtLeastOnce,
                handler(move |_topic, envelope| {
                    let svc = Arc::clone(&svc);
                    async move {
                        svc.handle_tts_request(envelope).await;
                        Ok(())
                    }
                }),
            )
            .await
            .map_err(|e| AliciaError::Transport(e.to_string()))?;

        // An AI answer feeds straight into synthesis, same session.
        let svc = Arc::clone(&service);
        runtime
            .subscribe(
                topics::AI_RESPONSE,
                QosLevel::AtLeastOnce,
                handler(move |_topic, envelope| {
                    let svc = Arc::clone(&svc);
                    async move {
                        svc.handle_ai_response(envelope).await;
                        Ok(())
                    }
                }),
            )
            .await
            .map_err(|e| AliciaError::Transport(e.to_string()))?;

        info!(engine = service.engine.name(), "tts service started");
        Ok(service)
    }

    pub fn runtime(&self) -> &Arc<ServiceRuntime> {
        &self.runtime
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn voices(&self) -> Vec<VoiceInfo> {
        self.engine.voices()
    }

    pub fn active_voice(&self) -> &str {
        &self.config.voice_model
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// HTTP entry: enqueue and wait for the result. Empty text is a
    /// validation error; a full queue sheds with `overload`.
    pub async fn submit(
        &self,
        text: String,
        voice: Option<String>,
        session_id: Option<String>,
        want_base64: bool,
    ) -> Result<TtsResult, AliciaError> {
        if text.is_empty() {
            return Err(AliciaError::Validation("text is required".into()));
        }

        let (tx, rx) = oneshot::channel();
        let job = Job {
            request: TtsJob {
                text,
                voice,
                session_id: session_id.unwrap_or_else(new_session_id),
            },
            want_base64,
            reply: JobReply::Http(tx),
        };
        self.enqueue(job)?;

        rx.await
            .map_err(|_| AliciaError::Internal("synthesis worker dropped the job".into()))
    }

    fn enqueue(&self, job: Job) -> Result<(), AliciaError> {
        match self.job_tx.try_send(job) {
            Ok(()) => {
                self.queue_depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(AliciaError::Overload("synthesis queue full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(AliciaError::Internal("synthesis worker stopped".into()))
            }
        }
    }

    async fn handle_tts_request(&self, envelope: Envelope) {
        let payload = &envelope.payload;
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if text.is_empty() {
            self.publish_error(&envelope, ErrorKind::Validation, "No text provided")
                .await;
            return;
        }

        let job = Job {
            request: TtsJob {
                text,
                voice: payload
                    .get("voice")
                    .and_then(Value::as_str)
                    .map(String::from),
                session_id: payload
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(new_session_id),
            },
            want_base64: payload
                .get("want_base64")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            reply: JobReply::Bus,
        };

        if let Err(e) = self.enqueue(job) {
            self.publish_error(&envelope, e.kind(), e.to_string()).await;
        }
    }

    async fn handle_ai_response(&self, envelope: Envelope) {
        let Ok(result) = serde_json::from_value::<AiResult>(envelope.payload.clone()) else {
            debug!("unparseable AI response ignored");
            return;
        };
        if result.response.is_empty() {
            return;
        }

        let job = Job {
            request: TtsJob {
                text: result.response,
                voice: None,
                // Same session: downstream delivery stays correlated with
                // the original utterance.
                session_id: result.session_id,
            },
            want_base64: false,
            reply: JobReply::Bus,
        };
        if let Err(e) = self.enqueue(job) {
            warn!(error = %e, "AI response synthesis dropped");
            self.runtime.record_error();
        }
    }

    /// Run one synthesis job against the engine.
    async fn synthesize(&self, request: &TtsJob, want_base64: bool) -> TtsResult {
        let start = std::time::Instant::now();
        let voice = request
            .voice
            .clone()
            .unwrap_or_else(|| self.config.voice_model.clone());

        let (text, _truncated) = truncate_text(&request.text, self.config.max_text_length);
        let output_path = std::env::temp_dir().join(format!(
            "alicia_tts_{}.wav",
            uuid::Uuid::new_v4().simple()
        ));

        let mut result = match self.engine.synthesize(&text, &voice, &output_path).await {
            Ok(()) => TtsResult {
                success: true,
                engine: self.engine.name().to_string(),
                text: Some(text),
                voice: Some(voice),
                audio_path: Some(output_path.to_string_lossy().into_owned()),
                audio_base64: None,
                processing_time: start.elapsed().as_secs_f64(),
                error: None,
                session_id: request.session_id.clone(),
            },
            Err(e) => {
                warn!(engine = self.engine.name(), error = %e, "synthesis failed");
                self.runtime.record_error();
                TtsResult {
                    success: false,
                    engine: self.engine.name().to_string(),
                    text: Some(text),
                    voice: Some(voice),
                    audio_path: None,
                    audio_base64: None,
                    processing_time: start.elapsed().as_secs_f64(),
                    error: Some(e.to_string()),
                    session_id: request.session_id.clone(),
                }
            }
        };

        if result.success && want_base64 {
            match tokio::fs::read(&output_path).await {
                Ok(audio) => result.audio_base64 = Some(BASE64.encode(audio)),
                Err(e) => warn!(error = %e, "failed to read audio for base64"),
            }
        }

        result
    }

    async fn publish_result(&self, result: &TtsResult) {
        let topic = if result.success {
            topics::TTS_RESPONSE
        } else {
            topics::TTS_ERROR
        };
        let payload = serde_json::json!({
            "session_id": result.session_id,
            "synthesis": result,
            "timestamp": epoch_secs(),
        });
        if let Err(e) = self
            .runtime
            .publish(topic, payload, Default::default())
            .await
        {
            warn!(topic = %topic, error = %e, "tts result publish failed");
        }
    }

    async fn publish_error(&self, request: &Envelope, kind: ErrorKind, error: impl Into<String>) {
        let reply = request.error_reply(self.runtime.service_name(), kind, error);
        if let Err(e) = self
            .runtime
            .publish_envelope(topics::TTS_ERROR, &reply, QosLevel::AtLeastOnce)
            .await
        {
            warn!(error = %e, "tts error publish failed");
        }
    }
}

/// Cap input length, marking the cut with a visible ellipsis.
pub fn truncate_text(text: &str, max_chars: usize) -> (String, bool) {
    if text.chars().count() <= max_chars {
        (text.to_string(), false)
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        (format!("{truncated}..."), true)
    }
}

/// Drain jobs sequentially; one engine invocation at a time.
async fn worker(service: Arc<TtsService>, mut job_rx: mpsc::Receiver<Job>) {
    while let Some(job) = job_rx.recv().await {
        service.queue_depth.fetch_sub(1, Ordering::Relaxed);
        let result = service.synthesize(&job.request, job.want_base64).await;

        match job.reply {
            JobReply::Http(tx) => {
                let _ = tx.send(result);
            }
            JobReply::Bus => service.publish_result(&result).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, TtsEngine};
    use async_trait::async_trait;
    use std::path::Path;

    struct MockEngine {
        fail: bool,
    }

    #[async_trait]
    impl TtsEngine for MockEngine {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn synthesize(
            &self,
            _text: &str,
            _voice: &str,
            output_path: &Path,
        ) -> Result<(), EngineError> {
            if self.fail {
                return Err(EngineError::InvalidOutput("mock failure".into()));
            }
            tokio::fs::write(output_path, b"RIFFmock").await?;
            Ok(())
        }

        fn voices(&self) -> Vec<VoiceInfo> {
            vec![]
        }
    }

    async fn test_service(fail: bool) -> Arc<TtsService> {
        let config = alicia_core::BusConfig {
            service_name: "tts_service".into(),
            environment: "test".into(),
            mqtt: alicia_core::MqttConfig {
                host: "127.0.0.1".into(),
                port: 41885,
                username: None,
                password: None,
                keepalive_secs: 60,
            },
            http: alicia_core::HttpConfig {
                host: "0.0.0.0".into(),
                port: 8003,
                advertise_host: "localhost".into(),
            },
        };
        let runtime = ServiceRuntime::connect(config, vec!["text_to_speech".into()], "1.0.0")
            .await
            .unwrap();
        let tts_config = TtsConfig {
            engine: "mock".into(),
            voice_model: "test-voice".into(),
            sample_rate: 22050,
            max_text_length: 1000,
            piper_bin: "piper".into(),
            piper_model_dir: "models".into(),
            google_api_key: None,
            azure_speech_key: None,
            azure_region: "eastus".into(),
        };
        TtsService::start(runtime, tts_config, Arc::new(MockEngine { fail }))
            .await
            .unwrap()
    }

    #[test]
    fn truncation_at_boundary() {
        let (text, truncated) = truncate_text("hello", 5);
        assert_eq!(text, "hello");
        assert!(!truncated);

        let (text, truncated) = truncate_text("hello!", 5);
        assert_eq!(text, "hello...");
        assert!(truncated);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let (text, truncated) = truncate_text("héllo wörld", 4);
        assert_eq!(text, "héll...");
        assert!(truncated);
    }

    #[tokio::test]
    async fn submit_synthesizes_and_reports_path() {
        let service = test_service(false).await;
        let result = service
            .submit("hello".into(), None, Some("session-1".into()), false)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.engine, "mock");
        assert_eq!(result.session_id, "session-1");
        assert!(result.processing_time >= 0.0);

        let path = result.audio_path.unwrap();
        let audio = std::fs::read(&path).unwrap();
        assert!(!audio.is_empty());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn submit_base64_inlines_audio() {
        let service = test_service(false).await;
        let result = service
            .submit("hello".into(), None, None, true)
            .await
            .unwrap();
        assert!(result.success);
        let audio = BASE64.decode(result.audio_base64.unwrap()).unwrap();
        assert_eq!(&audio, b"RIFFmock");
        if let Some(path) = result.audio_path {
            let _ = std::fs::remove_file(path);
        }
    }

    #[tokio::test]
    async fn empty_text_is_validation_error() {
        let service = test_service(false).await;
        let err = service.submit(String::new(), None, None, false).await.unwrap_err();
        assert!(matches!(err, AliciaError::Validation(_)));
    }

    #[tokio::test]
    async fn engine_failure_reported_in_band() {
        let service = test_service(true).await;
        let result = service
            .submit("hello".into(), None, None, false)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("mock failure"));
        assert!(result.audio_path.is_none());
    }
}
