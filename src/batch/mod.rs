//! Batch Coordinator
//!
//! Fans a bulk operation out into independent workflows. Concurrency is bounded
//! twice: by the number of workflows a batch runs at once, and by the
//! orchestrator's per-collaborator gate shared with every other caller.
//! One item's failure never affects the others.

use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::errors::{CertFlowError, ErrorResponse, Result};
use crate::workflow::{Orchestrator, Request, WorkflowOutcome, WorkflowState};

pub mod gate;

pub use gate::CollaboratorGate;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum BatchItemOutcome {
    Succeeded(WorkflowOutcome),
    Failed(ErrorResponse),
    /// Duplicate of a workflow that has not finished, or one that was cancelled
    Pending(WorkflowOutcome),
}

impl BatchItemOutcome {
    fn from_result(result: Result<WorkflowOutcome>) -> Self {
        match result {
            Ok(outcome) if outcome.state == WorkflowState::Completed => BatchItemOutcome::Succeeded(outcome),
            Ok(outcome) => match outcome.error.clone() {
                Some(error) => BatchItemOutcome::Failed(error),
                None => BatchItemOutcome::Pending(outcome),
            },
            Err(e) => BatchItemOutcome::Failed(ErrorResponse::new(&e)),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BatchItemOutcome::Succeeded(_))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    /// Position in the submitted batch
    pub index: usize,
    pub request_id: Uuid,
    pub idempotency_key: String,
    pub outcome: BatchItemOutcome,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: usize,
    pub failed: usize,
    pub pending: usize,
    /// In submission order
    pub items: Vec<BatchItem>,
}

pub struct BatchCoordinator {
    orchestrator: Arc<Orchestrator>,
    max_concurrent_workflows: usize,
    max_batch_size: usize,
}

impl BatchCoordinator {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &BatchConfig) -> Self {
        Self {
            orchestrator,
            max_concurrent_workflows: config.max_concurrent_workflows.max(1),
            max_batch_size: config.max_batch_size,
        }
    }

    /// Run every request to a terminal or parked state and report per item
    pub async fn run(&self, requests: Vec<Request>) -> Result<BatchReport> {
        if requests.len() > self.max_batch_size {
            return Err(CertFlowError::BatchTooLarge { size: requests.len(), max: self.max_batch_size });
        }

        let batch_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!("Batch {} started with {} requests", batch_id, requests.len());

        let identities: Vec<(Uuid, String)> = requests
            .iter()
            .map(|request| (request.request_id, request.idempotency_key.clone()))
            .collect();

        let slots = Arc::new(Semaphore::new(self.max_concurrent_workflows));
        let mut tasks: JoinSet<(usize, BatchItemOutcome)> = JoinSet::new();

        for (index, request) in requests.into_iter().enumerate() {
            let orchestrator = Arc::clone(&self.orchestrator);
            let slots = Arc::clone(&slots);
            tasks.spawn(async move {
                let _slot = slots.acquire_owned().await;
                let result = orchestrator.submit(request).await;
                (index, BatchItemOutcome::from_result(result))
            });
        }

        let mut outcomes: Vec<Option<BatchItemOutcome>> = identities.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    if let Some(slot) = outcomes.get_mut(index) {
                        *slot = Some(outcome);
                    }
                }
                Err(e) => error!("Batch {} item task failed: {}", batch_id, e),
            }
        }

        let items: Vec<BatchItem> = identities
            .into_iter()
            .zip(outcomes)
            .enumerate()
            .map(|(index, ((request_id, idempotency_key), outcome))| BatchItem {
                index,
                request_id,
                idempotency_key,
                outcome: outcome.unwrap_or_else(|| {
                    BatchItemOutcome::Failed(ErrorResponse::new(&CertFlowError::Internal {
                        message: "batch item task did not complete".to_string(),
                    }))
                }),
            })
            .collect();

        let succeeded = items.iter().filter(|item| item.outcome.is_success()).count();
        let failed = items
            .iter()
            .filter(|item| matches!(item.outcome, BatchItemOutcome::Failed(_)))
            .count();
        let pending = items.len() - succeeded - failed;

        if failed > 0 {
            warn!("Batch {} finished: {} succeeded, {} failed, {} pending", batch_id, succeeded, failed, pending);
        } else {
            info!("Batch {} finished: {} succeeded, {} pending", batch_id, succeeded, pending);
        }

        Ok(BatchReport {
            batch_id,
            started_at,
            finished_at: Utc::now(),
            succeeded,
            failed,
            pending,
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::audit::{AuditRecorder, InMemoryAuditSink};
    use crate::collaborators::{Collaborators, KeySpec};
    use crate::config::CertFlowConfig;
    use crate::policy::InMemoryPolicyStore;
    use crate::testing::{fast_config, SlowAuthority};
    use crate::workflow::{CertificateProfile, InMemoryWorkflowStore};

    fn orchestrator(config: &CertFlowConfig, collaborators: Collaborators) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            config,
            Arc::new(InMemoryPolicyStore::with_baseline()),
            collaborators,
            Arc::new(AuditRecorder::new(Arc::new(InMemoryAuditSink::new()))),
            Arc::new(InMemoryWorkflowStore::new()),
        ))
    }

    fn issue(subject: &str, bits: u32) -> Request {
        Request::issue(CertificateProfile::tls_server(subject, KeySpec::rsa(bits), 90), "operator")
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_item() {
        let config = fast_config();
        let coordinator = BatchCoordinator::new(orchestrator(&config, Collaborators::in_memory()), &config.batch);

        let report = coordinator
            .run(vec![
                issue("a.example.com", 4096),
                issue("b.example.com", 1024),
                issue("c.example.com", 3072),
            ])
            .await
            .unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.items.len(), 3);
        assert!(report.items[0].outcome.is_success());
        assert!(report.items[2].outcome.is_success());
        match &report.items[1].outcome {
            BatchItemOutcome::Failed(error) => {
                assert_eq!(error.code, "POLICY_VIOLATION");
                assert_eq!(error.rule_id.as_deref(), Some("min_key_size"));
                assert_eq!(error.policy_version.as_deref(), Some("2.3"));
            }
            other => panic!("Expected failure, got {:?}", other),
        }

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["items"][1]["outcome"]["status"], "failed");
    }

    #[tokio::test]
    async fn test_collaborator_in_flight_bound_holds() {
        let mut config = fast_config();
        config.batch.max_in_flight_per_collaborator = 2;
        config.batch.max_concurrent_workflows = 10;

        let authority = Arc::new(SlowAuthority::new(Duration::from_millis(40)));
        let collaborators = Collaborators { authority: authority.clone(), ..Collaborators::in_memory() };
        let coordinator = BatchCoordinator::new(orchestrator(&config, collaborators), &config.batch);

        let requests = (0..6).map(|i| issue(&format!("host{}.example.com", i), 4096)).collect();
        let report = coordinator.run(requests).await.unwrap();

        assert_eq!(report.succeeded, 6);
        assert!(authority.peak() <= 2);
        assert!(authority.peak() >= 1);
        assert_eq!(authority.inner.issued_count(), 6);
    }

    #[tokio::test]
    async fn test_queued_calls_are_not_charged_to_the_timeout() {
        let mut config = fast_config();
        config.batch.max_in_flight_per_collaborator = 1;
        config.batch.max_concurrent_workflows = 10;
        config.retry.call_timeout = Duration::from_millis(150);
        config.retry.max_attempts = 2;

        // Six calls of 100ms through one slot queue far longer than the timeout
        let authority = Arc::new(SlowAuthority::new(Duration::from_millis(100)));
        let collaborators = Collaborators { authority: authority.clone(), ..Collaborators::in_memory() };
        let coordinator = BatchCoordinator::new(orchestrator(&config, collaborators), &config.batch);

        let requests = (0..6).map(|i| issue(&format!("queued{}.example.com", i), 4096)).collect();
        let report = coordinator.run(requests).await.unwrap();

        assert_eq!(report.succeeded, 6);
        assert_eq!(report.pending, 0);
        assert_eq!(authority.peak(), 1);
        assert_eq!(authority.inner.issued_count(), 6);
    }

    #[tokio::test]
    async fn test_batch_size_guard() {
        let mut config = fast_config();
        config.batch.max_batch_size = 2;
        let coordinator = BatchCoordinator::new(orchestrator(&config, Collaborators::in_memory()), &config.batch);

        let requests = (0..3).map(|i| issue(&format!("h{}.example.com", i), 4096)).collect();
        let result = coordinator.run(requests).await;
        assert!(matches!(result, Err(CertFlowError::BatchTooLarge { size: 3, max: 2 })));
    }

    #[tokio::test]
    async fn test_duplicate_items_share_one_workflow() {
        let config = fast_config();
        let coordinator = BatchCoordinator::new(orchestrator(&config, Collaborators::in_memory()), &config.batch);

        let request = issue("dup.example.com", 4096);
        let report = coordinator.run(vec![request.clone(), request]).await.unwrap();

        let ids: Vec<Uuid> = report
            .items
            .iter()
            .filter_map(|item| match &item.outcome {
                BatchItemOutcome::Succeeded(outcome) | BatchItemOutcome::Pending(outcome) => Some(outcome.workflow_id),
                BatchItemOutcome::Failed(_) => None,
            })
            .collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);
    }
}
