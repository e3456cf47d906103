//! STT orchestration: bounded work queue, single transcription worker,
//! and result publication.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use alicia_bus::runtime::ServiceRuntime;
use alicia_bus::traits::handler;
use alicia_bus::{topics, Envelope, QosLevel};
use alicia_core::{AliciaError, ErrorKind};
use alicia_voice::{SttJob, SttResult};

use crate::engine::SttEngine;

const QUEUE_CAPACITY: usize = 16;

pub struct SttService {
    runtime: Arc<ServiceRuntime>,
    engine: Arc<dyn SttEngine>,
    client: reqwest::Client,
    job_tx: mpsc::Sender<SttJob>,
    queue_depth: Arc<AtomicUsize>,
}

impl SttService {
    pub async fn start(
        runtime: Arc<ServiceRuntime>,
        engine: Arc<dyn SttEngine>,
    ) -> Result<Arc<Self>, AliciaError> {
        let (job_tx, job_rx) = mpsc::channel(QUEUE_CAPACITY);
        let service = Arc::new(Self {
            runtime: Arc::clone(&runtime),
            engine,
            client: reqwest::Client::new(),
            job_tx,
            queue_depth: Arc::new(AtomicUsize::new(0)),
        });

        tokio::spawn(worker(Arc::clone(&service), job_rx));

        let svc = Arc::clone(&service);
        runtime
            .subscribe(
                topics::STT_REQUEST,
                QosLevel::AtLeastOnce,
                handler(move |_topic, envelope| {
                    let svc = Arc::clone(&svc);
                    async move {
                        svc.handle_request(envelope).await;
                        Ok(())
                    }
                }),
            )
            .await
            .map_err(|e| AliciaError::Transport(e.to_string()))?;

        info!(engine = service.engine.name(), "stt service started");
        Ok(service)
    }

    pub fn runtime(&self) -> &Arc<ServiceRuntime> {
        &self.runtime
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    async fn handle_request(&self, envelope: Envelope) {
        let job = match serde_json::from_value::<SttJob>(envelope.payload.clone()) {
            Ok(job) => job,
            Err(e) => {
                self.publish_error(&envelope, ErrorKind::Validation, format!("bad STT job: {e}"))
                    .await;
                return;
            }
        };
        if job.audio_base64.is_none() && job.audio_url.is_none() {
            self.publish_error(&envelope, ErrorKind::Validation, "no audio provided")
                .await;
            return;
        }

        match self.job_tx.try_send(job) {
            Ok(()) => {
                self.queue_depth.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.publish_error(&envelope, ErrorKind::Overload, "transcription queue full")
                    .await;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.publish_error(&envelope, ErrorKind::Internal, "transcription worker stopped")
                    .await;
            }
        }
    }

    /// Resolve the job's audio: inline base64 wins, URL fetch otherwise.
    async fn fetch_audio(&self, job: &SttJob) -> Result<Vec<u8>, AliciaError> {
        if let Some(encoded) = &job.audio_base64 {
            return BASE64
                .decode(encoded)
                .map_err(|_| AliciaError::Validation("audio_base64 is not valid base64".into()));
        }
        if let Some(url) = &job.audio_url {
            let response = self
                .client
                .get(url)
                .timeout(std::time::Duration::from_secs(10))
                .send()
                .await
                .map_err(|e| AliciaError::Transport(format!("audio fetch failed: {e}")))?;
            if !response.status().is_success() {
                return Err(AliciaError::Transport(format!(
                    "audio fetch returned {}",
                    response.status()
                )));
            }
            return response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| AliciaError::Transport(format!("audio read failed: {e}")));
        }
        Err(AliciaError::Validation("no audio provided".into()))
    }

    async fn transcribe(&self, job: &SttJob) -> Result<SttResult, AliciaError> {
        let audio = self.fetch_audio(job).await?;
        let start = std::time::Instant::now();

        let transcript = self
            .engine
            .transcribe(&audio, job.language.as_deref())
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::Timeout => AliciaError::Timeout(e.to_string()),
                ErrorKind::Transport => AliciaError::Transport(e.to_string()),
                _ => AliciaError::Internal(e.to_string()),
            })?;

        Ok(SttResult {
            text: transcript.text,
            language: transcript.language,
            confidence: transcript.confidence,
            stt_time_ms: start.elapsed().as_millis() as u64,
            engine: self.engine.name().to_string(),
            session_id: job.session_id.clone(),
        })
    }

    async fn publish_error(&self, request: &Envelope, kind: ErrorKind, error: impl Into<String>) {
        self.runtime.record_error();
        let reply = request.error_reply(self.runtime.service_name(), kind, error);
        if let Err(e) = self
            .runtime
            .publish_envelope(topics::STT_ERROR, &reply, QosLevel::AtLeastOnce)
            .await
        {
            warn!(error = %e, "stt error publish failed");
        }
    }
}

async fn worker(service: Arc<SttService>, mut job_rx: mpsc::Receiver<SttJob>) {
    while let Some(job) = job_rx.recv().await {
        service.queue_depth.fetch_sub(1, Ordering::Relaxed);
        let session_id = job.session_id.clone();

        match service.transcribe(&job).await {
            Ok(result) => {
                debug!(session = %session_id, chars = result.text.len(), "transcription done");
                let payload = serde_json::to_value(&result).unwrap_or(serde_json::Value::Null);
                if let Err(e) = service
                    .runtime
                    .publish(topics::STT_RESPONSE, payload, Default::default())
                    .await
                {
                    warn!(error = %e, "stt response publish failed");
                }
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "transcription failed");
                service.runtime.record_error();
                let payload = serde_json::json!({
                    "error": e.to_string(),
                    "error_kind": e.kind().as_str(),
                    "session_id": session_id,
                });
                if let Err(e) = service
                    .runtime
                    .publish(topics::STT_ERROR, payload, Default::default())
                    .await
                {
                    warn!(error = %e, "stt error publish failed");
                }
            }
        }
    }
}
