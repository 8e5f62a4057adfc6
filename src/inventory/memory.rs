//! In-Memory Certificate Inventory
//!
//! Storage backend for issued certificates, keyed by certificate id.

use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::collaborators::{CollaboratorKind, InventoryStore};
use crate::errors::CollaboratorError;
use super::{CertificateRecord, CertificateStatus};

/// Certificate inventory backed by a map
#[derive(Clone, Default)]
pub struct InMemoryInventory {
    /// Certificates by certificate id
    certificates: Arc<RwLock<HashMap<String, CertificateRecord>>>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.certificates.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.certificates.read().await.is_empty()
    }

    fn not_found(cert_id: &str) -> CollaboratorError {
        CollaboratorError::NotFound {
            collaborator: CollaboratorKind::Inventory,
            identifier: cert_id.to_string(),
        }
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventory {
    async fn upsert_certificate(&self, record: &CertificateRecord) -> Result<(), CollaboratorError> {
        let mut certs = self.certificates.write().await;
        certs.insert(record.cert_id.clone(), record.clone());
        debug!("Inventory stored certificate {} ({})", record.cert_id, record.subject);
        Ok(())
    }

    async fn get_certificate(&self, cert_id: &str) -> Result<Option<CertificateRecord>, CollaboratorError> {
        let certs = self.certificates.read().await;
        Ok(certs.get(cert_id).cloned())
    }

    async fn find_expiring(
        &self,
        threshold_days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<CertificateRecord>, CollaboratorError> {
        let horizon = now + ChronoDuration::days(i64::from(threshold_days));
        let certs = self.certificates.read().await;

        let mut expiring: Vec<CertificateRecord> = certs
            .values()
            .filter(|record| record.is_current() && record.expires_at <= horizon)
            .cloned()
            .collect();

        expiring.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(expiring)
    }

    async fn update_status(
        &self,
        cert_id: &str,
        status: CertificateStatus,
        reason: &str,
    ) -> Result<CertificateRecord, CollaboratorError> {
        let mut certs = self.certificates.write().await;
        let record = certs.get_mut(cert_id).ok_or_else(|| Self::not_found(cert_id))?;

        if !record.status.can_transition_to(status) {
            return Err(CollaboratorError::Rejected {
                collaborator: CollaboratorKind::Inventory,
                reason: format!("{} cannot move from {} to {}", cert_id, record.status, status),
            });
        }

        if record.status != status {
            record.status = status;
            record.status_changed_at = Some(Utc::now());
            if status == CertificateStatus::Revoked {
                record.revocation_reason = Some(reason.to_string());
            }
            debug!("Inventory status for {} set to {} ({})", cert_id, status, reason);
        }

        Ok(record.clone())
    }

    async fn mark_superseded(&self, cert_id: &str, successor_id: &str) -> Result<(), CollaboratorError> {
        let mut certs = self.certificates.write().await;
        let record = certs.get_mut(cert_id).ok_or_else(|| Self::not_found(cert_id))?;

        match &record.superseded_by {
            Some(existing) if existing != successor_id => Err(CollaboratorError::Rejected {
                collaborator: CollaboratorKind::Inventory,
                reason: format!("{} already superseded by {}", cert_id, existing),
            }),
            _ => {
                record.superseded_by = Some(successor_id.to_string());
                Ok(())
            }
        }
    }

    async fn list_certificates(
        &self,
        status: Option<CertificateStatus>,
    ) -> Result<Vec<CertificateRecord>, CollaboratorError> {
        let certs = self.certificates.read().await;
        let mut records: Vec<CertificateRecord> = certs
            .values()
            .filter(|record| status.map_or(true, |s| record.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.issued_at.cmp(&b.issued_at));
        Ok(records)
    }
}

#[cfg(test)]
pub(crate) fn sample_record(cert_id: &str, expires_in_days: i64) -> CertificateRecord {
    use crate::collaborators::{KeyReference, KeySpec, KeyUsageProfile};

    let now = Utc::now();
    CertificateRecord {
        cert_id: cert_id.to_string(),
        subject: format!("{}.example.com", cert_id),
        sans: vec![format!("{}.example.com", cert_id)],
        serial: format!("SERIAL-{}", cert_id),
        key_reference: KeyReference(format!("key-{}", cert_id)),
        key_spec: KeySpec::rsa(4096),
        key_usage: KeyUsageProfile::tls_server(),
        validity_days: 90,
        issued_at: now - ChronoDuration::days(90 - expires_in_days),
        expires_at: now + ChronoDuration::days(expires_in_days),
        status: CertificateStatus::Active,
        policy_version: "2.3".to_string(),
        renewed_from: None,
        superseded_by: None,
        revocation_reason: None,
        status_changed_at: None,
        workflow_id: uuid::Uuid::new_v4(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_and_get() {
        let inventory = InMemoryInventory::new();
        let record = sample_record("c1", 60);

        inventory.upsert_certificate(&record).await.unwrap();
        inventory.upsert_certificate(&record).await.unwrap();

        assert_eq!(inventory.len().await, 1);
        assert_eq!(inventory.get_certificate("c1").await.unwrap(), Some(record));
        assert!(inventory.get_certificate("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_expiring_skips_superseded_and_revoked() {
        let inventory = InMemoryInventory::new();
        inventory.upsert_certificate(&sample_record("soon", 10)).await.unwrap();
        inventory.upsert_certificate(&sample_record("later", 80)).await.unwrap();
        inventory.upsert_certificate(&sample_record("gone", -1)).await.unwrap();
        inventory.upsert_certificate(&sample_record("replaced", 5)).await.unwrap();
        inventory.upsert_certificate(&sample_record("revoked", 5)).await.unwrap();

        inventory.mark_superseded("replaced", "soon").await.unwrap();
        inventory.update_status("revoked", CertificateStatus::Revoked, "keyCompromise").await.unwrap();

        let expiring = inventory.find_expiring(30, Utc::now()).await.unwrap();
        let ids: Vec<&str> = expiring.iter().map(|r| r.cert_id.as_str()).collect();
        assert_eq!(ids, vec!["gone", "soon"]);
    }

    #[tokio::test]
    async fn test_update_status_is_monotonic() {
        let inventory = InMemoryInventory::new();
        inventory.upsert_certificate(&sample_record("c1", 60)).await.unwrap();

        let revoked = inventory.update_status("c1", CertificateStatus::Revoked, "superseded").await.unwrap();
        assert_eq!(revoked.status, CertificateStatus::Revoked);
        assert_eq!(revoked.revocation_reason.as_deref(), Some("superseded"));

        // Re-applying is a no-op, moving back is refused
        assert!(inventory.update_status("c1", CertificateStatus::Revoked, "superseded").await.is_ok());
        let result = inventory.update_status("c1", CertificateStatus::Active, "undo").await;
        assert!(matches!(result, Err(CollaboratorError::Rejected { .. })));

        let result = inventory.update_status("missing", CertificateStatus::Expired, "scan").await;
        assert!(matches!(result, Err(CollaboratorError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_mark_superseded_once() {
        let inventory = InMemoryInventory::new();
        inventory.upsert_certificate(&sample_record("old", 5)).await.unwrap();

        inventory.mark_superseded("old", "new").await.unwrap();
        inventory.mark_superseded("old", "new").await.unwrap();
        assert!(inventory.mark_superseded("old", "other").await.is_err());

        let record = inventory.get_certificate("old").await.unwrap().unwrap();
        assert_eq!(record.status, CertificateStatus::Active);
        assert!(!record.is_current());
    }
}
