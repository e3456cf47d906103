//! The security gateway: device authentication, token lifecycle, and
//! payload crypto, exposed over both HTTP and the bus.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use alicia_bus::runtime::ServiceRuntime;
use alicia_bus::traits::handler;
use alicia_bus::{topics, Envelope, QosLevel};
use alicia_core::AliciaError;

use crate::certs::{parse_certificate, CertificateRegistry};
use crate::crypto::MessageCrypto;
use crate::events::{SecurityEvent, SecurityEventLog};
use crate::tokens::{TokenOutcome, TokenStore, TOKEN_TTL_SECS};

/// Result of a successful device authentication.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuthGrant {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
    pub device_id: String,
}

pub struct SecurityGateway {
    runtime: Arc<ServiceRuntime>,
    crypto: MessageCrypto,
    certs_dir: std::path::PathBuf,
    tokens: Mutex<TokenStore>,
    certs: Mutex<CertificateRegistry>,
    events: Mutex<SecurityEventLog>,
}

impl SecurityGateway {
    pub fn new(
        runtime: Arc<ServiceRuntime>,
        keys_dir: &Path,
        certs_dir: &Path,
        token_secret: &str,
    ) -> Result<Arc<Self>, AliciaError> {
        std::fs::create_dir_all(certs_dir)?;
        Ok(Arc::new(Self {
            runtime,
            crypto: MessageCrypto::open(keys_dir)?,
            certs_dir: certs_dir.to_path_buf(),
            tokens: Mutex::new(TokenStore::new(token_secret)),
            certs: Mutex::new(CertificateRegistry::new()),
            events: Mutex::new(SecurityEventLog::new()),
        }))
    }

    /// Subscribe the gateway's bus request topics.
    pub async fn start_bus(self: Arc<Self>) -> Result<(), AliciaError> {
        for (topic, response_topic) in [
            (topics::SECURITY_AUTH, topics::SECURITY_AUTH_RESPONSE),
            (topics::SECURITY_ENCRYPT, topics::SECURITY_ENCRYPT_RESPONSE),
            (topics::SECURITY_VALIDATE, topics::SECURITY_VALIDATE_RESPONSE),
        ] {
            let gateway = Arc::clone(&self);
            self.runtime
                .subscribe(
                    topic,
                    QosLevel::AtLeastOnce,
                    handler(move |topic, envelope| {
                        let gateway = Arc::clone(&gateway);
                        async move {
                            gateway.handle_request(&topic, response_topic, envelope).await;
                            Ok(())
                        }
                    }),
                )
                .await
                .map_err(|e| AliciaError::Transport(e.to_string()))?;
        }
        Ok(())
    }

    /// Authenticate a device certificate and mint a bearer token.
    pub async fn authenticate_device(&self, certificate_pem: &str) -> Result<AuthGrant, AliciaError> {
        let identity = match parse_certificate(certificate_pem) {
            Ok(identity) => identity,
            Err(e) => {
                self.record_event(
                    "device_authentication_failed",
                    serde_json::json!({"error": e.to_string()}),
                )
                .await;
                return Err(e);
            }
        };

        let (token, _expires_at) = self
            .tokens
            .lock()
            .await
            .issue(&identity.device_id)
            .map_err(|e| AliciaError::Internal(format!("token mint failed: {e}")))?;

        self.certs
            .lock()
            .await
            .record(&identity.device_id, certificate_pem);
        // CN may contain path separators; keep the file inside certs_dir.
        let file_name = format!("{}.pem", identity.device_id.replace(['/', '\\'], "_"));
        let cert_path = self.certs_dir.join(file_name);
        if let Err(e) = tokio::fs::write(&cert_path, certificate_pem).await {
            warn!(path = %cert_path.display(), error = %e, "failed to persist certificate");
        }

        self.record_event(
            "device_authenticated",
            serde_json::json!({"device_id": identity.device_id}),
        )
        .await;

        Ok(AuthGrant {
            access_token: token,
            token_type: "bearer",
            expires_in: TOKEN_TTL_SECS as u64,
            device_id: identity.device_id,
        })
    }

    /// Validate a bearer token against the active store.
    pub async fn validate_token(&self, token: &str) -> TokenOutcome {
        let outcome = self.tokens.lock().await.validate(token);
        let event = match &outcome {
            TokenOutcome::Valid { device_id, .. } => {
                serde_json::json!({"result": "valid", "device_id": device_id})
            }
            TokenOutcome::Expired => serde_json::json!({"result": "expired"}),
            TokenOutcome::NotFound => serde_json::json!({"result": "not_found"}),
            TokenOutcome::Malformed => serde_json::json!({"result": "malformed"}),
        };
        self.record_event("token_validated", event).await;
        outcome
    }

    pub async fn encrypt_payload(&self, payload: &Value) -> Result<String, AliciaError> {
        match self.crypto.encrypt(payload) {
            Ok(blob) => {
                self.record_event("message_encrypted", serde_json::json!({})).await;
                Ok(blob)
            }
            Err(e) => {
                self.record_event(
                    "encryption_failed",
                    serde_json::json!({"error": e.to_string()}),
                )
                .await;
                Err(e)
            }
        }
    }

    pub async fn decrypt_payload(&self, encrypted: &str) -> Result<Value, AliciaError> {
        match self.crypto.decrypt(encrypted) {
            Ok(payload) => {
                self.record_event("message_decrypted", serde_json::json!({})).await;
                Ok(payload)
            }
            Err(e) => {
                self.record_event(
                    "decryption_failed",
                    serde_json::json!({"error": e.to_string()}),
                )
                .await;
                Err(e)
            }
        }
    }

    pub async fn recent_events(&self, limit: usize) -> Vec<SecurityEvent> {
        self.events.lock().await.recent(limit)
    }

    pub async fn certificate_ids(&self) -> Vec<String> {
        self.certs.lock().await.device_ids()
    }

    pub async fn active_token_count(&self) -> usize {
        self.tokens.lock().await.active_count()
    }

    pub fn runtime(&self) -> &Arc<ServiceRuntime> {
        &self.runtime
    }

    async fn record_event(&self, event_type: &str, details: Value) {
        self.events.lock().await.record(event_type, details);
    }

    /// Dispatch one bus request and publish the reply on the paired
    /// response topic.
    async fn handle_request(&self, topic: &str, response_topic: &str, envelope: Envelope) {
        let payload = match topic {
            topics::SECURITY_AUTH => {
                let certificate = envelope
                    .payload
                    .get("certificate")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if certificate.is_empty() {
                    serde_json::json!({"success": false, "error": "missing 'certificate'"})
                } else {
                    match self.authenticate_device(certificate).await {
                        Ok(grant) => serde_json::json!({
                            "success": true,
                            "token": grant.access_token,
                            "device_id": grant.device_id,
                            "expires_in": grant.expires_in,
                        }),
                        Err(e) => serde_json::json!({"success": false, "error": e.to_string()}),
                    }
                }
            }
            topics::SECURITY_ENCRYPT => match self.encrypt_payload(&envelope.payload).await {
                Ok(blob) => serde_json::json!({"encrypted_message": blob}),
                Err(e) => serde_json::json!({"error": e.to_string()}),
            },
            topics::SECURITY_VALIDATE => {
                let token = envelope
                    .payload
                    .get("token")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                token_outcome_json(&self.validate_token(token).await)
            }
            _ => return,
        };

        let reply = envelope.reply(self.runtime.service_name(), payload);
        if let Err(e) = self
            .runtime
            .publish_envelope(response_topic, &reply, QosLevel::AtLeastOnce)
            .await
        {
            warn!(topic = %response_topic, error = %e, "security response publish failed");
            self.runtime.record_error();
        }
    }
}

/// The wire shape of a validation result.
pub fn token_outcome_json(outcome: &TokenOutcome) -> Value {
    match outcome {
        TokenOutcome::Valid {
            device_id,
            expires_at,
        } => serde_json::json!({
            "valid": true,
            "device_id": device_id,
            "expires_at": expires_at,
        }),
        TokenOutcome::Expired => serde_json::json!({"valid": false, "error": "Token expired"}),
        TokenOutcome::NotFound => serde_json::json!({"valid": false, "error": "Token not found"}),
        TokenOutcome::Malformed => serde_json::json!({"valid": false, "error": "Invalid token"}),
    }
}
