//! Message crypto: a fresh AES-256-GCM key per message, wrapped with the
//! gateway's RSA key (OAEP/SHA-256).
//!
//! The ciphertext travels as one base64 string:
//! `[u16 wrapped-key length | wrapped key | 12-byte nonce | GCM ciphertext]`.
//! GCM authenticates the payload; there is no plaintext fallback.

use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde_json::Value;
use sha2::Sha256;
use tracing::info;

use alicia_core::AliciaError;

const RSA_BITS: usize = 2048;
const NONCE_LEN: usize = 12;
const KEY_FILE: &str = "encryption_key.pem";

pub struct MessageCrypto {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl MessageCrypto {
    /// Load the RSA key from `keys_dir`, generating and persisting one on
    /// first start.
    pub fn open(keys_dir: &Path) -> Result<Self, AliciaError> {
        std::fs::create_dir_all(keys_dir)?;
        let key_path = keys_dir.join(KEY_FILE);

        let private_key = if key_path.exists() {
            let pem = std::fs::read_to_string(&key_path)?;
            RsaPrivateKey::from_pkcs8_pem(&pem)
                .map_err(|e| AliciaError::Internal(format!("bad stored key: {e}")))?
        } else {
            info!(path = %key_path.display(), "generating RSA keypair");
            let key = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
                .map_err(|e| AliciaError::Internal(format!("keygen failed: {e}")))?;
            let pem = key
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| AliciaError::Internal(format!("key encode failed: {e}")))?;
            std::fs::write(&key_path, pem.as_bytes())?;
            key
        };

        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Ephemeral keypair for tests and short-lived processes.
    pub fn ephemeral() -> Result<Self, AliciaError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
            .map_err(|e| AliciaError::Internal(format!("keygen failed: {e}")))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Encrypt a JSON payload into the base64 blob format.
    pub fn encrypt(&self, payload: &Value) -> Result<String, AliciaError> {
        let plaintext = serde_json::to_vec(payload)?;

        let mut key_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut key_bytes);
        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|_| AliciaError::Internal("key setup failed".into()))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| AliciaError::Internal("encryption failed".into()))?;

        let wrapped_key = self
            .public_key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &key_bytes)
            .map_err(|e| AliciaError::Internal(format!("key wrap failed: {e}")))?;

        let mut blob = Vec::with_capacity(2 + wrapped_key.len() + NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&(wrapped_key.len() as u16).to_be_bytes());
        blob.extend_from_slice(&wrapped_key);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(blob))
    }

    /// Decrypt a blob produced by [`encrypt`](Self::encrypt). Tampered or
    /// truncated input fails; a GCM tag mismatch is an auth error.
    pub fn decrypt(&self, encrypted: &str) -> Result<Value, AliciaError> {
        let blob = BASE64
            .decode(encrypted)
            .map_err(|_| AliciaError::Validation("ciphertext is not valid base64".into()))?;

        if blob.len() < 2 {
            return Err(AliciaError::Validation("ciphertext too short".into()));
        }
        let key_len = u16::from_be_bytes([blob[0], blob[1]]) as usize;
        let rest = &blob[2..];
        if rest.len() < key_len + NONCE_LEN {
            return Err(AliciaError::Validation("ciphertext truncated".into()));
        }

        let (wrapped_key, rest) = rest.split_at(key_len);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

        let key = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), wrapped_key)
            .map_err(|_| AliciaError::Auth("key unwrap failed".into()))?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| AliciaError::Auth("unwrapped key has wrong size".into()))?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| AliciaError::Auth("decryption failed (authentication)".into()))?;

        Ok(serde_json::from_slice(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let crypto = MessageCrypto::ephemeral().unwrap();
        let payload = json!({
            "command": "on",
            "parameters": {"brightness": 50},
            "nested": {"deep": [1, 2, 3]},
        });

        let blob = crypto.encrypt(&payload).unwrap();
        assert_ne!(blob, payload.to_string());
        let decrypted = crypto.decrypt(&blob).unwrap();
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn each_encryption_is_unique() {
        let crypto = MessageCrypto::ephemeral().unwrap();
        let payload = json!({"x": 1});
        let a = crypto.encrypt(&payload).unwrap();
        let b = crypto.encrypt(&payload).unwrap();
        // Fresh key + nonce per message.
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let crypto = MessageCrypto::ephemeral().unwrap();
        let blob = crypto.encrypt(&json!({"secret": true})).unwrap();

        let mut raw = BASE64.decode(&blob).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let tampered = BASE64.encode(raw);

        let err = crypto.decrypt(&tampered).unwrap_err();
        assert!(matches!(err, AliciaError::Auth(_)));
    }

    #[test]
    fn malformed_inputs_rejected() {
        let crypto = MessageCrypto::ephemeral().unwrap();
        assert!(matches!(
            crypto.decrypt("!!not-base64!!"),
            Err(AliciaError::Validation(_))
        ));
        assert!(matches!(
            crypto.decrypt(&BASE64.encode([0u8])),
            Err(AliciaError::Validation(_))
        ));
    }

    #[test]
    fn wrong_key_cannot_decrypt() {
        let alice = MessageCrypto::ephemeral().unwrap();
        let mallory = MessageCrypto::ephemeral().unwrap();

        let blob = alice.encrypt(&json!({"secret": 42})).unwrap();
        assert!(matches!(mallory.decrypt(&blob), Err(AliciaError::Auth(_))));
    }

    #[test]
    fn key_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let blob = {
            let crypto = MessageCrypto::open(dir.path()).unwrap();
            crypto.encrypt(&json!({"v": 1})).unwrap()
        };
        // Reopening loads the same key, so old ciphertext still decrypts.
        let crypto = MessageCrypto::open(dir.path()).unwrap();
        assert_eq!(crypto.decrypt(&blob).unwrap(), json!({"v": 1}));
    }
}
