//! Single-writer locks keyed by `(subject, key reference)`.
//!
//! Contention is reported immediately as a conflict; nothing waits in a queue.
//! A workflow that parks keeps its lock until it reaches a terminal state.

use std::sync::Arc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::collaborators::KeyReference;
use crate::errors::{CertFlowError, Result};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub subject: String,
    /// `None` for issuance, where no key exists yet
    pub key_reference: Option<KeyReference>,
}

impl LockKey {
    pub fn new(subject: &str, key_reference: Option<KeyReference>) -> Self {
        Self { subject: subject.to_string(), key_reference }
    }
}

#[derive(Clone, Default)]
pub struct SubjectLocks {
    held: Arc<DashMap<LockKey, Uuid>>,
}

impl SubjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `key` for `holder`. A holder re-acquiring a lock it retained succeeds.
    pub fn try_acquire(&self, key: LockKey, holder: Uuid) -> Result<LockGuard> {
        match self.held.entry(key.clone()) {
            Entry::Occupied(existing) if *existing.get() == holder => {
                debug!("Lock on {} re-acquired by workflow {}", key.subject, holder);
                Ok(LockGuard { held: self.held.clone(), key, holder, retained: false })
            }
            Entry::Occupied(existing) => {
                let current = *existing.get();
                warn!("Lock on {} held by workflow {}, refusing {}", key.subject, current, holder);
                Err(CertFlowError::ConcurrencyConflict {
                    subject: key.subject,
                    key_reference: key.key_reference.map(|k| k.0),
                    holder: current,
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(holder);
                debug!("Lock on {} acquired by workflow {}", key.subject, holder);
                Ok(LockGuard { held: self.held.clone(), key, holder, retained: false })
            }
        }
    }

    /// Re-register a lock retained by a parked workflow before a restart
    pub fn restore(&self, key: LockKey, holder: Uuid) {
        debug!("Lock on {} restored for parked workflow {}", key.subject, holder);
        self.held.insert(key, holder);
    }

    /// Drop every lock `holder` still owns
    pub fn release_all(&self, holder: Uuid) {
        self.held.retain(|_, current| *current != holder);
    }

    pub fn holder(&self, key: &LockKey) -> Option<Uuid> {
        self.held.get(key).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Releases the lock when dropped
pub struct LockGuard {
    held: Arc<DashMap<LockKey, Uuid>>,
    key: LockKey,
    holder: Uuid,
    retained: bool,
}

impl LockGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Keep the lock held after the guard goes away; `release_all` frees it
    pub fn retain(mut self) {
        self.retained = true;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.retained {
            debug!("Lock on {} retained by workflow {}", self.key.subject, self.holder);
            return;
        }
        self.held.remove_if(&self.key, |_, holder| *holder == self.holder);
        debug!("Lock on {} released by workflow {}", self.key.subject, self.holder);
    }
}
