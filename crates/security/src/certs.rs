//! Device certificate parsing and the certificate registry.

use std::collections::HashMap;

use serde::Serialize;
use x509_parser::pem::parse_x509_pem;

use alicia_core::{epoch_secs, AliciaError};

/// Identity extracted from a validated device certificate.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// Certificate common name.
    pub device_id: String,
    pub not_before: f64,
    pub not_after: f64,
}

/// Parse a PEM certificate and check it: inside its validity window, with a
/// non-empty common name. Full CA chain validation is out of scope here —
/// devices are enrolled out of band.
pub fn parse_certificate(pem: &str) -> Result<DeviceIdentity, AliciaError> {
    let (_, parsed_pem) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| AliciaError::Auth(format!("invalid PEM: {e}")))?;
    let cert = parsed_pem
        .parse_x509()
        .map_err(|e| AliciaError::Auth(format!("invalid certificate: {e}")))?;

    let not_before = cert.validity().not_before.timestamp() as f64;
    let not_after = cert.validity().not_after.timestamp() as f64;
    let now = epoch_secs();
    if now < not_before || now > not_after {
        return Err(AliciaError::Auth("certificate outside validity window".into()));
    }

    let device_id = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AliciaError::Auth("certificate has no common name".into()))?
        .to_string();

    Ok(DeviceIdentity {
        device_id,
        not_before,
        not_after,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct CertificateRecord {
    pub device_id: String,
    #[serde(skip)]
    pub pem: String,
    pub registered_at: f64,
    pub last_seen: f64,
}

/// In-memory registry of certificates that authenticated successfully.
#[derive(Default)]
pub struct CertificateRegistry {
    records: HashMap<String, CertificateRecord>,
}

impl CertificateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or refresh) a certificate for a device.
    pub fn record(&mut self, device_id: &str, pem: &str) {
        let now = epoch_secs();
        self.records
            .entry(device_id.to_string())
            .and_modify(|r| {
                r.pem = pem.to_string();
                r.last_seen = now;
            })
            .or_insert_with(|| CertificateRecord {
                device_id: device_id.to_string(),
                pem: pem.to_string(),
                registered_at: now,
                last_seen: now,
            });
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(cn: &str) -> String {
        let mut params = rcgen::CertificateParams::new(vec![]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, cn);
        let key_pair = rcgen::KeyPair::generate().unwrap();
        params.self_signed(&key_pair).unwrap().pem()
    }

    fn expired(cn: &str) -> String {
        let mut params = rcgen::CertificateParams::new(vec![]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, cn);
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(2021, 1, 1);
        let key_pair = rcgen::KeyPair::generate().unwrap();
        params.self_signed(&key_pair).unwrap().pem()
    }

    #[test]
    fn valid_certificate_yields_cn() {
        let pem = self_signed("dev-1");
        let identity = parse_certificate(&pem).unwrap();
        assert_eq!(identity.device_id, "dev-1");
        assert!(identity.not_after > epoch_secs());
    }

    #[test]
    fn expired_certificate_rejected() {
        let pem = expired("dev-1");
        let err = parse_certificate(&pem).unwrap_err();
        assert!(matches!(err, AliciaError::Auth(_)));
        assert!(err.to_string().contains("validity"));
    }

    #[test]
    fn garbage_rejected() {
        assert!(matches!(
            parse_certificate("not a certificate"),
            Err(AliciaError::Auth(_))
        ));
    }

    #[test]
    fn registry_refresh_keeps_registered_at() {
        let mut registry = CertificateRegistry::new();
        registry.record("dev-1", "PEM-A");
        let first = registry.records["dev-1"].registered_at;

        registry.record("dev-1", "PEM-B");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.records["dev-1"].registered_at, first);
        assert_eq!(registry.records["dev-1"].pem, "PEM-B");
    }

    #[test]
    fn device_ids_sorted() {
        let mut registry = CertificateRegistry::new();
        registry.record("b", "p");
        registry.record("a", "p");
        assert_eq!(registry.device_ids(), vec!["a".to_string(), "b".to_string()]);
    }
}
