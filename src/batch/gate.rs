//! Per-collaborator in-flight bound shared by every workflow of an orchestrator.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::collaborators::CollaboratorKind;

#[derive(Clone)]
pub struct CollaboratorGate {
    limit: usize,
    permits: HashMap<CollaboratorKind, Arc<Semaphore>>,
}

impl CollaboratorGate {
    pub fn new(max_in_flight: usize) -> Self {
        let limit = max_in_flight.max(1);
        let permits = CollaboratorKind::ALL
            .iter()
            .map(|kind| (*kind, Arc::new(Semaphore::new(limit))))
            .collect();
        Self { limit, permits }
    }

    /// Wait for a call slot on `kind`. The slot is released when the permit drops.
    pub async fn acquire(&self, kind: CollaboratorKind) -> Option<OwnedSemaphorePermit> {
        let semaphore = self.permits.get(&kind)?.clone();
        semaphore.acquire_owned().await.ok()
    }

    pub fn in_flight(&self, kind: CollaboratorKind) -> usize {
        self.permits
            .get(&kind)
            .map_or(0, |semaphore| self.limit - semaphore.available_permits())
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permits_bound_each_collaborator() {
        let gate = CollaboratorGate::new(2);

        let a = gate.acquire(CollaboratorKind::CertificateAuthority).await;
        let _b = gate.acquire(CollaboratorKind::CertificateAuthority).await;
        assert_eq!(gate.in_flight(CollaboratorKind::CertificateAuthority), 2);
        assert_eq!(gate.in_flight(CollaboratorKind::KeyCustody), 0);

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            gate.acquire(CollaboratorKind::CertificateAuthority),
        )
        .await;
        assert!(blocked.is_err());

        drop(a);
        assert!(gate.acquire(CollaboratorKind::CertificateAuthority).await.is_some());
    }
}
