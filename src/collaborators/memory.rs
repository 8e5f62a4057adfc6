//! In-Process Reference Collaborators
//!
//! Stand-ins for the external trust services, used for local development and
//! tests. They produce opaque handles and placeholder artefacts; no real key
//! material or signatures are ever created here.

use std::sync::atomic::{AtomicU64, Ordering};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use sha2::{Sha256, Digest};
use tracing::{debug, info};

use crate::errors::CollaboratorError;
use super::{
    CertificateAuthority, CollaboratorKind, CsrBuilder, IssuedCertificate, KeyCustody, KeyReference,
    KeySpec, KeyUsageProfile, RevocationAck,
};

#[derive(Clone, Debug)]
struct CustodyEntry {
    spec: KeySpec,
    public_key: Vec<u8>,
}

/// Custody simulator handing out `custody-key-<uuid>` handles
#[derive(Default)]
pub struct InMemoryKeyCustody {
    keys: DashMap<String, CustodyEntry>,
    generations: AtomicU64,
    destructions: AtomicU64,
}

impl InMemoryKeyCustody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation_count(&self) -> u64 {
        self.generations.load(Ordering::Relaxed)
    }

    pub fn destruction_count(&self) -> u64 {
        self.destructions.load(Ordering::Relaxed)
    }

    pub fn contains(&self, key: &KeyReference) -> bool {
        self.keys.contains_key(key.as_str())
    }

    fn not_found(key: &KeyReference) -> CollaboratorError {
        CollaboratorError::NotFound {
            collaborator: CollaboratorKind::KeyCustody,
            identifier: key.to_string(),
        }
    }
}

#[async_trait]
impl KeyCustody for InMemoryKeyCustody {
    async fn generate(&self, spec: &KeySpec) -> Result<KeyReference, CollaboratorError> {
        let handle = format!("custody-key-{}", uuid::Uuid::new_v4());

        // Placeholder public key: digest of the handle, never a usable key
        let public_key = Sha256::digest(handle.as_bytes()).to_vec();

        self.keys.insert(handle.clone(), CustodyEntry { spec: spec.clone(), public_key });
        self.generations.fetch_add(1, Ordering::Relaxed);

        debug!("Custody key generated: {} ({})", handle, spec.algorithm);
        Ok(KeyReference(handle))
    }

    async fn get_public_key(&self, key: &KeyReference) -> Result<Vec<u8>, CollaboratorError> {
        self.keys
            .get(key.as_str())
            .map(|entry| entry.public_key.clone())
            .ok_or_else(|| Self::not_found(key))
    }

    async fn rotate(&self, key: &KeyReference) -> Result<KeyReference, CollaboratorError> {
        let spec = self
            .keys
            .get(key.as_str())
            .map(|entry| entry.spec.clone())
            .ok_or_else(|| Self::not_found(key))?;

        let successor = self.generate(&spec).await?;
        debug!("Custody key rotated: {} -> {}", key, successor);
        Ok(successor)
    }

    async fn destroy(&self, key: &KeyReference) -> Result<(), CollaboratorError> {
        if self.keys.remove(key.as_str()).is_some() {
            self.destructions.fetch_add(1, Ordering::Relaxed);
            info!("Custody key destroyed: {}", key);
        }
        Ok(())
    }
}

/// CSR builder emitting a JSON request template instead of a signed PKCS#10
#[derive(Clone, Copy, Debug, Default)]
pub struct TemplateCsrBuilder;

#[async_trait]
impl CsrBuilder for TemplateCsrBuilder {
    async fn build(
        &self,
        subject: &str,
        sans: &[String],
        public_key: &[u8],
        profile: &KeyUsageProfile,
    ) -> Result<Vec<u8>, CollaboratorError> {
        if subject.is_empty() {
            return Err(CollaboratorError::malformed(CollaboratorKind::CsrBuilder, "empty subject"));
        }
        if public_key.is_empty() {
            return Err(CollaboratorError::malformed(CollaboratorKind::CsrBuilder, "empty public key"));
        }

        let template = serde_json::json!({
            "subject": subject,
            "sans": sans,
            "public_key": hex::encode(public_key),
            "key_usages": profile.key_usages,
            "extended_key_usages": profile.extended_key_usages,
        });

        serde_json::to_vec(&template)
            .map_err(|e| CollaboratorError::malformed(CollaboratorKind::CsrBuilder, e.to_string()))
    }
}

/// Certificate authority simulator with an idempotency-key index
pub struct InMemoryCertificateAuthority {
    issued: DashMap<String, IssuedCertificate>,
    revoked: DashMap<String, RevocationAck>,
    next_serial: AtomicU64,
}

impl Default for InMemoryCertificateAuthority {
    fn default() -> Self {
        Self {
            issued: DashMap::new(),
            revoked: DashMap::new(),
            next_serial: AtomicU64::new(1),
        }
    }
}

impl InMemoryCertificateAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct certificates issued
    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }

    pub fn is_revoked(&self, serial: &str) -> bool {
        self.revoked.contains_key(serial)
    }
}

#[async_trait]
impl CertificateAuthority for InMemoryCertificateAuthority {
    async fn issue(
        &self,
        csr: &[u8],
        validity_days: u32,
        idempotency_key: &str,
    ) -> Result<IssuedCertificate, CollaboratorError> {
        if csr.is_empty() {
            return Err(CollaboratorError::malformed(CollaboratorKind::CertificateAuthority, "empty CSR"));
        }

        // A repeated key is answered with the original certificate
        let entry = self.issued.entry(idempotency_key.to_string()).or_insert_with(|| {
            let serial = format!("{:016X}", self.next_serial.fetch_add(1, Ordering::SeqCst));
            let not_before = Utc::now();
            let not_after = not_before + ChronoDuration::days(i64::from(validity_days));

            let mut certificate = Sha256::digest(csr).to_vec();
            certificate.extend_from_slice(serial.as_bytes());

            info!("CA issued certificate {} for key {}", serial, idempotency_key);
            IssuedCertificate { certificate, serial, not_before, not_after }
        });

        Ok(entry.value().clone())
    }

    async fn find_issued(&self, idempotency_key: &str) -> Result<Option<IssuedCertificate>, CollaboratorError> {
        Ok(self.issued.get(idempotency_key).map(|entry| entry.value().clone()))
    }

    async fn revoke(&self, serial: &str, reason: &str) -> Result<RevocationAck, CollaboratorError> {
        if !self.issued.iter().any(|entry| entry.value().serial == serial) {
            return Err(CollaboratorError::NotFound {
                collaborator: CollaboratorKind::CertificateAuthority,
                identifier: serial.to_string(),
            });
        }

        let ack = self
            .revoked
            .entry(serial.to_string())
            .or_insert_with(|| RevocationAck {
                serial: serial.to_string(),
                reason: reason.to_string(),
                revoked_at: Utc::now(),
            })
            .value()
            .clone();

        info!("CA revoked certificate {} ({})", serial, ack.reason);
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_custody_lifecycle() {
        let custody = InMemoryKeyCustody::new();

        let key = custody.generate(&KeySpec::rsa(4096)).await.unwrap();
        assert!(key.as_str().starts_with("custody-key-"));
        assert_eq!(custody.get_public_key(&key).await.unwrap().len(), 32);

        let rotated = custody.rotate(&key).await.unwrap();
        assert_ne!(rotated, key);
        assert_eq!(custody.generation_count(), 2);

        custody.destroy(&key).await.unwrap();
        assert!(!custody.contains(&key));
        assert!(custody.get_public_key(&key).await.is_err());
        assert_eq!(custody.destruction_count(), 1);
    }

    #[tokio::test]
    async fn test_csr_builder_rejects_empty_subject() {
        let builder = TemplateCsrBuilder;
        let result = builder.build("", &[], b"pk", &KeyUsageProfile::default()).await;
        assert!(matches!(result, Err(CollaboratorError::MalformedInput { .. })));

        let csr = builder
            .build("api.example.com", &["api.example.com".to_string()], b"pk", &KeyUsageProfile::tls_server())
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&csr).unwrap();
        assert_eq!(parsed["subject"], "api.example.com");
    }

    #[tokio::test]
    async fn test_ca_issue_is_idempotent_per_key() {
        let ca = InMemoryCertificateAuthority::new();

        let first = ca.issue(b"csr", 90, "wf-1:ca_submission").await.unwrap();
        let second = ca.issue(b"csr", 90, "wf-1:ca_submission").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(ca.issued_count(), 1);

        let other = ca.issue(b"csr", 90, "wf-2:ca_submission").await.unwrap();
        assert_ne!(first.serial, other.serial);
        assert_eq!((first.not_after - first.not_before).num_days(), 90);
    }

    #[tokio::test]
    async fn test_ca_revoke_unknown_serial() {
        let ca = InMemoryCertificateAuthority::new();
        assert!(ca.revoke("FFFF", "keyCompromise").await.is_err());

        let cert = ca.issue(b"csr", 30, "k").await.unwrap();
        let ack = ca.revoke(&cert.serial, "keyCompromise").await.unwrap();
        assert_eq!(ack.reason, "keyCompromise");
        assert!(ca.is_revoked(&cert.serial));
    }
}
