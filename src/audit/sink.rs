//! Audit Sinks
//!
//! Durable destinations for audit entries. `append` returns only once the entry
//! is persisted; entries are never edited or removed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::errors::{CertFlowError, Result, StorageError};
use super::AuditEntry;

#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist `entry` before returning
    async fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// Every entry in append order
    async fn entries(&self) -> Result<Vec<AuditEntry>>;
}

/// Audit sink held in memory
#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Overwrite an entry in place, bypassing the append-only contract
    #[cfg(test)]
    pub(crate) async fn tamper<F: FnOnce(&mut AuditEntry)>(&self, index: usize, edit: F) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(index) {
            edit(entry);
        }
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.entries.read().await.clone())
    }
}

/// Append-only JSON-lines file, synced to disk on every append
pub struct FileAuditSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileAuditSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // Create the file up front so a bad path fails at startup
        OpenOptions::new().create(true).append(true).open(&path).await.map_err(|e| {
            StorageError::WriteFailed {
                operation: format!("open audit log {}", path.display()),
                reason: e.to_string(),
            }
        })?;

        Ok(Self { path, write_lock: Mutex::new(()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_failed(&self, reason: impl ToString) -> StorageError {
        StorageError::WriteFailed {
            operation: format!("append audit log {}", self.path.display()),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl AuditSink for FileAuditSink {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.write_failed(e))?;

        file.write_all(&line).await.map_err(|e| self.write_failed(e))?;
        file.sync_data().await.map_err(|e| self.write_failed(e))?;

        debug!("Audit entry {}#{} persisted", entry.workflow_id, entry.sequence_no);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<AuditEntry>> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| StorageError::ReadFailed {
            operation: format!("read audit log {}", self.path.display()),
            reason: e.to_string(),
        })?;

        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(number, line)| {
                serde_json::from_str(line).map_err(|_| {
                    CertFlowError::from(StorageError::DataCorruption {
                        location: format!("{}:{}", self.path.display(), number + 1),
                    })
                })
            })
            .collect()
    }
}
