//! AI orchestration: consumes transcripts, produces answers, and hands the
//! session to the TTS stage via the response topic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use alicia_bus::runtime::ServiceRuntime;
use alicia_bus::traits::handler;
use alicia_bus::{topics, Envelope, QosLevel};
use alicia_core::{AliciaError, ErrorKind};
use alicia_voice::{AiJob, AiResult, RateLimiter, SttResult};

use crate::provider::{BackendError, ChatBackend, ChatMessage, Role};

const QUEUE_CAPACITY: usize = 16;

const SYSTEM_PROMPT: &str =
    "You are Alicia, a friendly smart-home voice assistant. Answer briefly in \
     plain spoken language; the reply will be read aloud.";

pub struct AiService {
    runtime: Arc<ServiceRuntime>,
    backend: Arc<dyn ChatBackend>,
    limiter: Arc<RateLimiter>,
    max_tokens: u32,
    job_tx: mpsc::Sender<AiJob>,
    queue_depth: Arc<AtomicUsize>,
}

impl AiService {
    pub async fn start(
        runtime: Arc<ServiceRuntime>,
        backend: Arc<dyn ChatBackend>,
        limiter: Arc<RateLimiter>,
        max_tokens: u32,
    ) -> Result<Arc<Self>, AliciaError> {
        let (job_tx, job_rx) = mpsc::channel(QUEUE_CAPACITY);
        let service = Arc::new(Self {
            runtime: Arc::clone(&runtime),
            backend,
            limiter,
            max_tokens,
            job_tx,
            queue_depth: Arc::new(AtomicUsize::new(0)),
        });

        tokio::spawn(worker(Arc::clone(&service), job_rx));

        let svc = Arc::clone(&service);
        runtime
            .subscribe(
                topics::AI_REQUEST,
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

        // A finished transcript is the next stage's input.
        let svc = Arc::clone(&service);
        runtime
            .subscribe(
                topics::STT_RESPONSE,
                QosLevel::AtLeastOnce,
                handler(move |_topic, envelope| {
                    let svc = Arc::clone(&svc);
                    async move {
                        svc.handle_transcript(envelope).await;
                        Ok(())
                    }
                }),
            )
            .await
            .map_err(|e| AliciaError::Transport(e.to_string()))?;

        info!(model = service.backend.model(), "ai service started");
        Ok(service)
    }

    pub fn runtime(&self) -> &Arc<ServiceRuntime> {
        &self.runtime
    }

    pub fn model(&self) -> &str {
        self.backend.model()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    async fn handle_request(&self, envelope: Envelope) {
        match serde_json::from_value::<AiJob>(envelope.payload.clone()) {
            Ok(job) if !job.text.is_empty() => self.enqueue(job, Some(&envelope)).await,
            Ok(_) => {
                self.publish_error_reply(&envelope, ErrorKind::Validation, "empty text")
                    .await;
            }
            Err(e) => {
                self.publish_error_reply(&envelope, ErrorKind::Validation, format!("bad AI job: {e}"))
                    .await;
            }
        }
    }

    async fn handle_transcript(&self, envelope: Envelope) {
        let Ok(result) = serde_json::from_value::<SttResult>(envelope.payload.clone()) else {
            debug!("unparseable transcript ignored");
            return;
        };
        if result.text.is_empty() {
            return;
        }
        self.enqueue(
            AiJob {
                text: result.text,
                context: None,
                session_id: result.session_id,
            },
            None,
        )
        .await;
    }

    async fn enqueue(&self, job: AiJob, request: Option<&Envelope>) {
        match self.job_tx.try_send(job) {
            Ok(()) => {
                self.queue_depth.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                // The limiter already paces the worker; a full queue means
                // sustained overload. Shed with an error envelope.
                warn!(session = %job.session_id, "ai queue full, job shed");
                if let Some(envelope) = request {
                    self.publish_error_reply(envelope, ErrorKind::Overload, "ai queue full")
                        .await;
                } else {
                    self.publish_session_error(&job.session_id, ErrorKind::Overload, "ai queue full")
                        .await;
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("ai worker stopped, job dropped");
                self.runtime.record_error();
            }
        }
    }

    async fn answer(&self, job: &AiJob) -> Result<AiResult, BackendError> {
        let start = std::time::Instant::now();

        let mut messages = vec![ChatMessage {
            role: Role::System,
            content: SYSTEM_PROMPT.to_string(),
        }];
        if let Some(context) = &job.context {
            messages.push(ChatMessage {
                role: Role::System,
                content: format!("Current context: {context}"),
            });
        }
        messages.push(ChatMessage {
            role: Role::User,
            content: job.text.clone(),
        });

        // Sleep-not-drop: the limiter delays the worker until capacity
        // frees up in both windows.
        self.limiter.acquire(estimate_tokens(&job.text, self.max_tokens)).await;

        let completion = self.backend.complete(messages).await?;
        self.limiter.record_usage(completion.tokens_used).await;

        Ok(AiResult {
            response: completion.text,
            tokens_used: completion.tokens_used,
            model: completion.model,
            ai_time_ms: start.elapsed().as_millis() as u64,
            session_id: job.session_id.clone(),
        })
    }

    async fn publish_error_reply(&self, request: &Envelope, kind: ErrorKind, error: impl Into<String>) {
        self.runtime.record_error();
        let reply = request.error_reply(self.runtime.service_name(), kind, error);
        if let Err(e) = self
            .runtime
            .publish_envelope(topics::AI_ERROR, &reply, QosLevel::AtLeastOnce)
            .await
        {
            warn!(error = %e, "ai error publish failed");
        }
    }

    async fn publish_session_error(&self, session_id: &str, kind: ErrorKind, error: &str) {
        self.runtime.record_error();
        let payload = serde_json::json!({
            "error": error,
            "error_kind": kind.as_str(),
            "session_id": session_id,
        });
        if let Err(e) = self
            .runtime
            .publish(topics::AI_ERROR, payload, Default::default())
            .await
        {
            warn!(error = %e, "ai error publish failed");
        }
    }
}

/// Rough prompt-size estimate: ~4 chars per token plus the reply budget.
fn estimate_tokens(text: &str, max_tokens: u32) -> u64 {
    (text.chars().count() as u64 / 4) + max_tokens as u64
}

async fn worker(service: Arc<AiService>, mut job_rx: mpsc::Receiver<AiJob>) {
    while let Some(job) = job_rx.recv().await {
        service.queue_depth.fetch_sub(1, Ordering::Relaxed);

        match service.answer(&job).await {
            Ok(result) => {
                debug!(
                    session = %result.session_id,
                    tokens = result.tokens_used,
                    ms = result.ai_time_ms,
                    "ai answer ready"
                );
                let payload = serde_json::to_value(&result).unwrap_or(serde_json::Value::Null);
                if let Err(e) = service
                    .runtime
                    .publish(topics::AI_RESPONSE, payload, Default::default())
                    .await
                {
                    warn!(error = %e, "ai response publish failed");
                }
            }
            Err(e) => {
                warn!(session = %job.session_id, error = %e, "ai completion failed");
                let kind = match &e {
                    BackendError::Http(_) | BackendError::Api { .. } => ErrorKind::Transport,
                    BackendError::Parse(_) => ErrorKind::Internal,
                    BackendError::NotConfigured(_) => ErrorKind::Internal,
                };
                service
                    .publish_session_error(&job.session_id, kind, &e.to_string())
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_scales_with_input() {
        assert_eq!(estimate_tokens("", 256), 256);
        assert_eq!(estimate_tokens("abcdefgh", 256), 258);
    }
}
