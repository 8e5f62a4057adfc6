//! Orphaned Key Reaper
//!
//! Keys generated for a workflow that is aborted or cancelled before a
//! certificate is issued are never referenced by the inventory. They are held
//! for a retention period and then destroyed through key custody.

use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Serialize, Deserialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::collaborators::{KeyCustody, KeyReference};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrphanedKey {
    pub key_reference: KeyReference,
    pub workflow_id: Uuid,
    pub orphaned_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReapReport {
    pub destroyed: Vec<KeyReference>,
    pub failed: Vec<(KeyReference, String)>,
    pub retained: usize,
}

pub struct OrphanedKeyReaper {
    custody: Arc<dyn KeyCustody>,
    retention: Duration,
    pending: DashMap<KeyReference, OrphanedKey>,
}

impl OrphanedKeyReaper {
    pub fn new(custody: Arc<dyn KeyCustody>, retention: Duration) -> Self {
        Self { custody, retention, pending: DashMap::new() }
    }

    pub fn register(&self, key_reference: KeyReference, workflow_id: Uuid, orphaned_at: DateTime<Utc>) {
        info!("Key {} orphaned by workflow {}", key_reference, workflow_id);
        self.pending.insert(
            key_reference.clone(),
            OrphanedKey { key_reference, workflow_id, orphaned_at },
        );
    }

    pub fn pending(&self) -> Vec<OrphanedKey> {
        let mut keys: Vec<OrphanedKey> = self.pending.iter().map(|entry| entry.value().clone()).collect();
        keys.sort_by_key(|key| key.orphaned_at);
        keys
    }

    /// Destroy every key orphaned at least `retention` before `now`.
    /// Keys whose destruction fails stay pending for the next pass.
    pub async fn collect(&self, now: DateTime<Utc>) -> ReapReport {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let due: Vec<OrphanedKey> = self
            .pending()
            .into_iter()
            .filter(|key| now.signed_duration_since(key.orphaned_at) >= retention)
            .collect();

        let mut report = ReapReport::default();
        for key in due {
            match self.custody.destroy(&key.key_reference).await {
                Ok(()) => {
                    self.pending.remove(&key.key_reference);
                    report.destroyed.push(key.key_reference);
                }
                Err(e) => {
                    warn!("Failed to destroy orphaned key {}: {}", key.key_reference, e);
                    report.failed.push((key.key_reference, e.to_string()));
                }
            }
        }
        report.retained = self.pending.len();

        if !report.destroyed.is_empty() {
            info!("Reaped {} orphaned keys, {} retained", report.destroyed.len(), report.retained);
        }
        report
    }
}
