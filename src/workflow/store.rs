//! Workflow Instance Stores
//!
//! Instances are saved after every transition so a restarted process resumes
//! from the last completed step.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{CertFlowError, Result, StorageError};
use super::WorkflowInstance;

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn save(&self, instance: &WorkflowInstance) -> Result<()>;

    async fn get(&self, workflow_id: Uuid) -> Result<Option<WorkflowInstance>>;

    /// Most recently created instance for a request idempotency key
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<WorkflowInstance>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|instance| instance.request.idempotency_key == key)
            .max_by_key(|instance| instance.created_at))
    }

    async fn list(&self) -> Result<Vec<WorkflowInstance>>;
}

#[derive(Clone, Default)]
pub struct InMemoryWorkflowStore {
    instances: Arc<RwLock<HashMap<Uuid, WorkflowInstance>>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn save(&self, instance: &WorkflowInstance) -> Result<()> {
        self.instances.write().await.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get(&self, workflow_id: Uuid) -> Result<Option<WorkflowInstance>> {
        Ok(self.instances.read().await.get(&workflow_id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<WorkflowInstance>> {
        Ok(self
            .instances
            .read()
            .await
            .values()
            .filter(|instance| instance.request.idempotency_key == key)
            .max_by_key(|instance| instance.created_at)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<WorkflowInstance>> {
        let mut instances: Vec<WorkflowInstance> = self.instances.read().await.values().cloned().collect();
        instances.sort_by_key(|instance| instance.created_at);
        Ok(instances)
    }
}

/// One JSON document per workflow, replaced atomically through a rename.
///
/// Idempotency keys are indexed in memory, rebuilt once when the store opens.
pub struct FileWorkflowStore {
    dir: PathBuf,
    /// Request idempotency key to the newest workflow created for it
    keys: RwLock<HashMap<String, (Uuid, DateTime<Utc>)>>,
}

impl FileWorkflowStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| StorageError::WriteFailed {
            operation: format!("create workflow dir {}", dir.display()),
            reason: e.to_string(),
        })?;

        let store = Self { dir, keys: RwLock::new(HashMap::new()) };
        let existing = store.list().await?;
        {
            let mut keys = store.keys.write().await;
            for instance in &existing {
                Self::index(&mut keys, instance);
            }
        }
        debug!("Workflow store {} opened with {} workflows", store.dir.display(), existing.len());
        Ok(store)
    }

    fn index(keys: &mut HashMap<String, (Uuid, DateTime<Utc>)>, instance: &WorkflowInstance) {
        let newest = keys
            .get(&instance.request.idempotency_key)
            .map_or(true, |(_, created_at)| instance.created_at >= *created_at);
        if newest {
            keys.insert(instance.request.idempotency_key.clone(), (instance.id, instance.created_at));
        }
    }

    fn path_for(&self, workflow_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", workflow_id))
    }

    async fn read(&self, path: &Path) -> Result<WorkflowInstance> {
        let contents = tokio::fs::read(path).await.map_err(|e| StorageError::ReadFailed {
            operation: format!("read workflow {}", path.display()),
            reason: e.to_string(),
        })?;
        serde_json::from_slice(&contents).map_err(|_| {
            CertFlowError::from(StorageError::DataCorruption {
                location: path.display().to_string(),
            })
        })
    }
}

#[async_trait]
impl WorkflowStore for FileWorkflowStore {
    async fn save(&self, instance: &WorkflowInstance) -> Result<()> {
        let path = self.path_for(instance.id);
        let staging = path.with_extension("json.tmp");
        let contents = serde_json::to_vec_pretty(instance)?;

        let write_failed = |e: std::io::Error| StorageError::WriteFailed {
            operation: format!("save workflow {}", instance.id),
            reason: e.to_string(),
        };

        let mut file = tokio::fs::File::create(&staging).await.map_err(write_failed)?;
        file.write_all(&contents).await.map_err(write_failed)?;
        file.sync_all().await.map_err(write_failed)?;
        drop(file);
        tokio::fs::rename(&staging, &path).await.map_err(write_failed)?;
        Self::index(&mut *self.keys.write().await, instance);

        debug!("Workflow {} saved in state {}", instance.id, instance.state);
        Ok(())
    }

    async fn get(&self, workflow_id: Uuid) -> Result<Option<WorkflowInstance>> {
        let path = self.path_for(workflow_id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        self.read(&path).await.map(Some)
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<WorkflowInstance>> {
        let indexed = self.keys.read().await.get(key).map(|(workflow_id, _)| *workflow_id);
        match indexed {
            Some(workflow_id) => self.get(workflow_id).await,
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<WorkflowInstance>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| StorageError::ReadFailed {
            operation: format!("list workflows in {}", self.dir.display()),
            reason: e.to_string(),
        })?;

        let mut instances = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                instances.push(self.read(&path).await?);
            }
        }
        instances.sort_by_key(|instance| instance.created_at);
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use crate::collaborators::KeySpec;
    use crate::workflow::{CertificateProfile, Request, WorkflowState};

    fn instance(subject: &str) -> WorkflowInstance {
        let profile = CertificateProfile::tls_server(subject, KeySpec::rsa(4096), 90);
        WorkflowInstance::new(Request::issue(profile, "operator"))
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let mut saved = instance("api.example.com");

        {
            let store = FileWorkflowStore::open(dir.path()).await.unwrap();
            store.save(&saved).await.unwrap();
            saved.state = WorkflowState::KeyReady;
            store.save(&saved).await.unwrap();
        }

        let store = FileWorkflowStore::open(dir.path()).await.unwrap();
        let loaded = store.get(saved.id).await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_idempotency_key() {
        let store = InMemoryWorkflowStore::new();
        let first = instance("a.example.com");
        store.save(&first).await.unwrap();
        store.save(&instance("b.example.com")).await.unwrap();

        let found = store.find_by_idempotency_key(&first.request.idempotency_key).await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
        assert!(store.find_by_idempotency_key("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_indexes_keys_across_reopen() {
        let dir = TempDir::new().unwrap();
        let first = instance("api.example.com");
        let key = first.request.idempotency_key.clone();

        {
            let store = FileWorkflowStore::open(dir.path()).await.unwrap();
            store.save(&first).await.unwrap();
            assert_eq!(store.find_by_idempotency_key(&key).await.unwrap().map(|found| found.id), Some(first.id));
        }

        // A later workflow for the same key supersedes the earlier one in the index
        let mut retry = WorkflowInstance::new(first.request.clone());
        retry.created_at = first.created_at + chrono::Duration::seconds(1);

        let store = FileWorkflowStore::open(dir.path()).await.unwrap();
        assert_eq!(store.find_by_idempotency_key(&key).await.unwrap().map(|found| found.id), Some(first.id));
        store.save(&retry).await.unwrap();
        assert_eq!(store.find_by_idempotency_key(&key).await.unwrap().map(|found| found.id), Some(retry.id));
        assert!(store.find_by_idempotency_key("unknown").await.unwrap().is_none());
    }
}
