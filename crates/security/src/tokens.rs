//! Bearer token lifecycle.
//!
//! Tokens are HS256 JWTs carrying the device identity, but the in-memory
//! active-token store is authoritative: a decodable token the gateway never
//! minted (or one lost to a restart) is rejected. Expired tokens are
//! evicted lazily on lookup.

use std::collections::HashMap;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use alicia_core::epoch_secs;

/// Token lifetime: 1 hour.
pub const TOKEN_TTL_SECS: f64 = 3600.0;

const ISSUER: &str = "alicia-security-gateway";

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    device_id: String,
    iat: u64,
    exp: u64,
    iss: String,
}

#[derive(Debug, Clone)]
struct TokenInfo {
    device_id: String,
    issued_at: f64,
    expires_at: f64,
}

/// Outcome of a token validation, one variant per distinct error kind.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenOutcome {
    Valid { device_id: String, expires_at: f64 },
    Expired,
    NotFound,
    Malformed,
}

pub struct TokenStore {
    secret: String,
    active: HashMap<String, TokenInfo>,
}

impl TokenStore {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            active: HashMap::new(),
        }
    }

    /// Mint a bearer token for an authenticated device. Returns
    /// `(token, expires_at)`.
    pub fn issue(&mut self, device_id: &str) -> Result<(String, f64), jsonwebtoken::errors::Error> {
        let now = epoch_secs();
        let expires_at = now + TOKEN_TTL_SECS;
        let claims = Claims {
            device_id: device_id.to_string(),
            iat: now as u64,
            exp: expires_at as u64,
            iss: ISSUER.to_string(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?;
        self.active.insert(
            token.clone(),
            TokenInfo {
                device_id: device_id.to_string(),
                issued_at: now,
                expires_at,
            },
        );
        Ok((token, expires_at))
    }

    /// Check a token against the store and its expiry. Expired entries are
    /// removed as a side effect.
    pub fn validate(&mut self, token: &str) -> TokenOutcome {
        // Signature/shape check first: garbage is Malformed regardless of
        // what the store says.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.validate_exp = false; // expiry handled via the store below
        if decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .is_err()
        {
            return TokenOutcome::Malformed;
        }

        let Some(info) = self.active.get(token) else {
            return TokenOutcome::NotFound;
        };

        if epoch_secs() > info.expires_at {
            self.active.remove(token);
            return TokenOutcome::Expired;
        }

        TokenOutcome::Valid {
            device_id: info.device_id.clone(),
            expires_at: info.expires_at,
        }
    }

    /// Issue timestamp for an active token (diagnostics).
    pub fn issued_at(&self, token: &str) -> Option<f64> {
        self.active.get(token).map(|i| i.issued_at)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
