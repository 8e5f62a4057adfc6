//! External Collaborator Interfaces
//!
//! Key custody, CSR construction, certificate authority and inventory are trusted
//! external services. The core never generates keys, signs, or builds CSRs itself;
//! it only decides whether and how to invoke these collaborators.

use std::fmt;
use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::errors::CollaboratorError;
use crate::inventory::{CertificateRecord, CertificateStatus, InMemoryInventory};

pub mod memory;

pub use memory::{InMemoryCertificateAuthority, InMemoryKeyCustody, TemplateCsrBuilder};

/// Identifies a collaborator for error attribution and rate limiting
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorKind {
    KeyCustody,
    CsrBuilder,
    CertificateAuthority,
    Inventory,
    AuditSink,
}

impl CollaboratorKind {
    pub const ALL: [CollaboratorKind; 5] = [
        CollaboratorKind::KeyCustody,
        CollaboratorKind::CsrBuilder,
        CollaboratorKind::CertificateAuthority,
        CollaboratorKind::Inventory,
        CollaboratorKind::AuditSink,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollaboratorKind::KeyCustody => "key_custody",
            CollaboratorKind::CsrBuilder => "csr_builder",
            CollaboratorKind::CertificateAuthority => "certificate_authority",
            CollaboratorKind::Inventory => "inventory",
            CollaboratorKind::AuditSink => "audit_sink",
        }
    }
}

impl fmt::Display for CollaboratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle to key material held by the key custody service
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyReference(pub String);

impl KeyReference {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Requested key parameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpec {
    /// Algorithm family, e.g. `RSA`, `ECC`
    pub algorithm: String,
    /// Modulus size for RSA keys
    pub key_size: Option<u32>,
    /// Named curve for elliptic-curve keys
    pub curve: Option<String>,
}

impl KeySpec {
    pub fn rsa(bits: u32) -> Self {
        Self {
            algorithm: "RSA".to_string(),
            key_size: Some(bits),
            curve: None,
        }
    }

    pub fn ecc(curve: &str) -> Self {
        Self {
            algorithm: "ECC".to_string(),
            key_size: None,
            curve: Some(curve.to_string()),
        }
    }
}

/// Key usage and extended key usage requested for a certificate
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyUsageProfile {
    pub key_usages: Vec<String>,
    pub extended_key_usages: Vec<String>,
}

impl KeyUsageProfile {
    /// digitalSignature + keyEncipherment with serverAuth
    pub fn tls_server() -> Self {
        Self {
            key_usages: vec!["digitalSignature".to_string(), "keyEncipherment".to_string()],
            extended_key_usages: vec!["serverAuth".to_string()],
        }
    }
}

/// Certificate returned by the certificate authority
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    /// DER or PEM bytes as produced by the CA
    pub certificate: Vec<u8>,
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Acknowledgement of a revocation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationAck {
    pub serial: String,
    pub reason: String,
    pub revoked_at: DateTime<Utc>,
}

/// Key custody service. Never returns raw private key material.
#[async_trait]
pub trait KeyCustody: Send + Sync {
    async fn generate(&self, spec: &KeySpec) -> Result<KeyReference, CollaboratorError>;

    async fn get_public_key(&self, key: &KeyReference) -> Result<Vec<u8>, CollaboratorError>;

    /// Replace the key behind `key`, returning the reference of the successor
    async fn rotate(&self, key: &KeyReference) -> Result<KeyReference, CollaboratorError>;

    async fn destroy(&self, key: &KeyReference) -> Result<(), CollaboratorError>;
}

/// Builds a certificate signing request with the custody-held key
#[async_trait]
pub trait CsrBuilder: Send + Sync {
    async fn build(
        &self,
        subject: &str,
        sans: &[String],
        public_key: &[u8],
        profile: &KeyUsageProfile,
    ) -> Result<Vec<u8>, CollaboratorError>;
}

/// Certificate authority.
///
/// `issue` is not idempotent on the remote side, so the authority must also answer
/// `find_issued` for an idempotency key it has already served.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    async fn issue(
        &self,
        csr: &[u8],
        validity_days: u32,
        idempotency_key: &str,
    ) -> Result<IssuedCertificate, CollaboratorError>;

    async fn find_issued(&self, idempotency_key: &str) -> Result<Option<IssuedCertificate>, CollaboratorError>;

    async fn revoke(&self, serial: &str, reason: &str) -> Result<RevocationAck, CollaboratorError>;
}

/// System of record for certificates
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Insert or replace by `cert_id`
    async fn upsert_certificate(&self, record: &CertificateRecord) -> Result<(), CollaboratorError>;

    async fn get_certificate(&self, cert_id: &str) -> Result<Option<CertificateRecord>, CollaboratorError>;

    /// Active, non-superseded certificates expiring within `threshold_days` of `now`
    /// (already expired ones included)
    async fn find_expiring(
        &self,
        threshold_days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<CertificateRecord>, CollaboratorError>;

    /// Monotonic status change. Re-applying the current status is a no-op.
    async fn update_status(
        &self,
        cert_id: &str,
        status: CertificateStatus,
        reason: &str,
    ) -> Result<CertificateRecord, CollaboratorError>;

    async fn mark_superseded(&self, cert_id: &str, successor_id: &str) -> Result<(), CollaboratorError>;

    async fn list_certificates(
        &self,
        status: Option<CertificateStatus>,
    ) -> Result<Vec<CertificateRecord>, CollaboratorError>;
}

/// The set of collaborators one orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub key_custody: Arc<dyn KeyCustody>,
    pub csr_builder: Arc<dyn CsrBuilder>,
    pub authority: Arc<dyn CertificateAuthority>,
    pub inventory: Arc<dyn InventoryStore>,
}

impl Collaborators {
    /// In-process reference collaborators for development and tests
    pub fn in_memory() -> Self {
        Self {
            key_custody: Arc::new(InMemoryKeyCustody::new()),
            csr_builder: Arc::new(TemplateCsrBuilder),
            authority: Arc::new(InMemoryCertificateAuthority::new()),
            inventory: Arc::new(InMemoryInventory::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collaborator_kind_display() {
        assert_eq!(CollaboratorKind::CertificateAuthority.to_string(), "certificate_authority");
        let json = serde_json::to_string(&CollaboratorKind::KeyCustody).unwrap();
        assert_eq!(json, "\"key_custody\"");
    }

    #[test]
    fn test_key_spec_constructors() {
        let rsa = KeySpec::rsa(4096);
        assert_eq!(rsa.algorithm, "RSA");
        assert_eq!(rsa.key_size, Some(4096));

        let ecc = KeySpec::ecc("P-256");
        assert_eq!(ecc.curve.as_deref(), Some("P-256"));
        assert!(ecc.key_size.is_none());
    }
}
