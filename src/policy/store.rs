//! Policy Store
//!
//! Versioned, append-only set of policy documents. Readers get the current
//! set through an atomically swapped pointer and never block on publishers.

use std::sync::Arc;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::info;

use crate::errors::{CertFlowError, Result};
use super::{PolicyDocument, PolicySnapshot};

#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Latest document whose effective date is not after `effective_at`
    async fn load(&self, effective_at: DateTime<Utc>) -> Result<PolicySnapshot>;

    /// Exact historical version, used when a workflow resumes
    async fn get_version(&self, version: &str) -> Result<Option<PolicySnapshot>>;

    async fn publish(&self, document: PolicyDocument) -> Result<PolicySnapshot>;
}

/// In-process policy store
pub struct InMemoryPolicyStore {
    /// Published documents ordered by effective date
    documents: ArcSwap<Vec<PolicySnapshot>>,
    /// Serializes publishers; readers go through `documents` only
    publish_lock: Mutex<()>,
}

impl Default for InMemoryPolicyStore {
    fn default() -> Self {
        Self {
            documents: ArcSwap::from_pointee(Vec::new()),
            publish_lock: Mutex::new(()),
        }
    }
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with the v2.3 baseline document
    pub fn with_baseline() -> Self {
        let store = Self::new();
        store.documents.store(Arc::new(vec![Arc::new(PolicyDocument::baseline())]));
        store
    }

    pub fn versions(&self) -> Vec<String> {
        self.documents.load().iter().map(|doc| doc.version.clone()).collect()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn load(&self, effective_at: DateTime<Utc>) -> Result<PolicySnapshot> {
        let documents = self.documents.load();
        documents
            .iter()
            .rev()
            .find(|doc| doc.effective_date <= effective_at)
            .cloned()
            .ok_or_else(|| CertFlowError::PolicyUnavailable { at: effective_at.to_rfc3339() })
    }

    async fn get_version(&self, version: &str) -> Result<Option<PolicySnapshot>> {
        Ok(self.documents.load().iter().find(|doc| doc.version == version).cloned())
    }

    async fn publish(&self, document: PolicyDocument) -> Result<PolicySnapshot> {
        document.validate()?;

        let _guard = self.publish_lock.lock().await;
        let current = self.documents.load_full();

        if current.iter().any(|doc| doc.version == document.version) {
            return Err(CertFlowError::DuplicatePolicyVersion { version: document.version });
        }

        let snapshot = Arc::new(document);
        let mut next: Vec<PolicySnapshot> = current.iter().cloned().collect();
        next.push(snapshot.clone());
        // Stable sort keeps publication order among equal effective dates
        next.sort_by(|a, b| a.effective_date.cmp(&b.effective_date));

        self.documents.store(Arc::new(next));
        info!("Published policy v{} effective {}", snapshot.version, snapshot.effective_date);

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn test_load_resolves_by_effective_date() {
        let store = InMemoryPolicyStore::with_baseline();
        let now = Utc::now();

        let future = PolicyDocument::baseline().successor("2.4", now + ChronoDuration::days(7));
        store.publish(future).await.unwrap();

        assert_eq!(store.load(now).await.unwrap().version, "2.3");
        assert_eq!(store.load(now + ChronoDuration::days(8)).await.unwrap().version, "2.4");
        assert_eq!(store.versions(), vec!["2.3", "2.4"]);
    }

    #[tokio::test]
    async fn test_empty_store_is_unavailable() {
        let store = InMemoryPolicyStore::new();
        assert!(matches!(store.load(Utc::now()).await, Err(CertFlowError::PolicyUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_publish_rejects_duplicates_and_invalid() {
        let store = InMemoryPolicyStore::with_baseline();

        let duplicate = PolicyDocument::baseline();
        assert!(matches!(store.publish(duplicate).await, Err(CertFlowError::DuplicatePolicyVersion { .. })));

        let mut invalid = PolicyDocument::baseline().successor("3.0", Utc::now());
        invalid.rules.roles.clear();
        assert!(matches!(store.publish(invalid).await, Err(CertFlowError::InvalidPolicy { .. })));
    }

    #[tokio::test]
    async fn test_captured_snapshot_survives_publication() {
        let store = InMemoryPolicyStore::with_baseline();
        let captured = store.load(Utc::now()).await.unwrap();

        let mut stricter = PolicyDocument::baseline().successor("2.4", Utc::now());
        stricter.rules.validity.max_days = 90;
        store.publish(stricter).await.unwrap();

        assert_eq!(captured.rules.validity.max_days, 397);
        assert_eq!(store.load(Utc::now()).await.unwrap().version, "2.4");

        let historical = store.get_version("2.3").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&historical, &captured));
        assert!(store.get_version("9.9").await.unwrap().is_none());
    }
}
