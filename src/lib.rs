//! certflow - Policy-Gated Certificate Lifecycle Orchestration
//!
//! Drives issuance, renewal and revocation of certificates through external
//! trust-service collaborators (key custody, CSR builder, certificate
//! authority, inventory). Every request is evaluated against a versioned
//! policy, every collaborator call runs under idempotent retries, and every
//! workflow transition is written to a hash-chained audit trail before the
//! workflow moves on.

pub mod audit;
pub mod batch;
pub mod collaborators;
pub mod config;
pub mod errors;
pub mod inventory;
pub mod logging;
pub mod policy;
pub mod retry;
pub mod scanner;
pub mod workflow;

#[cfg(test)]
mod testing;

// Re-export main types
pub use audit::{
    AuditEntry, AuditOutcome, AuditRecorder, AuditSink, ComplianceReport, ComplianceStatus, FileAuditSink,
    InMemoryAuditSink, PolicyViolationRecord,
};
pub use batch::{BatchCoordinator, BatchItemOutcome, BatchReport, CollaboratorGate};
pub use collaborators::{
    CertificateAuthority, CollaboratorKind, Collaborators, CsrBuilder, InventoryStore, KeyCustody, KeyReference,
    KeySpec, KeyUsageProfile,
};
pub use config::CertFlowConfig;
pub use errors::{CertFlowError, CollaboratorError, ErrorResponse, Result};
pub use inventory::{CertificateRecord, CertificateStatus};
pub use policy::{Decision, InMemoryPolicyStore, PolicyDocument, PolicyEvaluator, PolicySnapshot, PolicyStore, RuleId};
pub use scanner::{ExpiryReport, ExpiryScanner};
pub use workflow::{
    CertificateProfile, Orchestrator, ReapReport, Request, RequestKind, WorkflowInstance, WorkflowOutcome,
    WorkflowState,
};

use std::sync::Arc;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use workflow::{FileWorkflowStore, InMemoryWorkflowStore, WorkflowStore};

/// Main certflow service coordinator
pub struct CertFlow {
    /// Workflow state machine
    orchestrator: Arc<Orchestrator>,
    /// Renewal request producer
    scanner: Arc<ExpiryScanner>,
    /// Bulk request fan-out
    batch: BatchCoordinator,
    /// Versioned policy documents
    policies: Arc<dyn PolicyStore>,
    /// Scanner, dispatcher and reaper tasks
    task_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// Configuration
    config: Arc<CertFlowConfig>,
}

impl CertFlow {
    /// Wire the orchestrator, scanner and batch coordinator over `collaborators`.
    ///
    /// Storage locations in `config.storage` select file-backed audit and
    /// workflow stores; absent locations keep them in memory.
    pub async fn new(config: CertFlowConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        logging::init(&config.logging)?;
        info!("Initializing certflow");

        let policies: Arc<dyn PolicyStore> = match &config.storage.policy_path {
            Some(path) => {
                let store = Arc::new(InMemoryPolicyStore::new());
                let document = PolicyDocument::from_file(path)?;
                store.publish(document).await?;
                store
            }
            None => Arc::new(InMemoryPolicyStore::with_baseline()),
        };

        let sink: Arc<dyn AuditSink> = match &config.storage.audit_log_path {
            Some(path) => Arc::new(FileAuditSink::open(path).await?),
            None => Arc::new(InMemoryAuditSink::new()),
        };
        let audit = Arc::new(AuditRecorder::recover(sink).await?);

        let store: Arc<dyn WorkflowStore> = match &config.storage.workflow_dir {
            Some(dir) => Arc::new(FileWorkflowStore::open(dir).await?),
            None => Arc::new(InMemoryWorkflowStore::new()),
        };

        let orchestrator = Arc::new(Orchestrator::new(
            &config,
            policies.clone(),
            collaborators.clone(),
            audit,
            store,
        ));
        let scanner = Arc::new(ExpiryScanner::new(
            collaborators.inventory.clone(),
            policies.clone(),
            config.scanner.clone(),
        ));
        let batch = BatchCoordinator::new(orchestrator.clone(), &config.batch);

        info!("certflow initialized");
        Ok(Self {
            orchestrator,
            scanner,
            batch,
            policies,
            task_handles: Arc::new(Mutex::new(Vec::new())),
            config: Arc::new(config),
        })
    }

    /// In-memory stores and reference collaborators, for development only
    pub async fn new_for_testing() -> Result<Self> {
        warn!("Creating certflow with in-memory collaborators - for development only");
        Self::new(CertFlowConfig::localhost_testing(), Collaborators::in_memory()).await
    }

    /// Resume workflows interrupted by a previous process
    pub async fn start(&self) -> Result<usize> {
        let recovered = self.orchestrator.recover().await?;
        let failed = recovered.iter().filter(|result| result.is_err()).count();
        if failed > 0 {
            warn!("{} of {} recovered workflows failed", failed, recovered.len());
        }
        info!("certflow started, {} workflows recovered", recovered.len());
        Ok(recovered.len())
    }

    /// Start the periodic expiry scan, its renewal dispatcher and the orphaned-key reaper
    pub async fn start_scanner(&self) -> Result<()> {
        let mut handles = self.task_handles.lock().await;

        let (queue, mut renewals) = mpsc::channel::<Request>(self.config.batch.max_batch_size.max(1));
        handles.push(self.scanner.clone().spawn(queue));

        // Renewal dispatcher
        let orchestrator = self.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            while let Some(request) = renewals.recv().await {
                let target = request.target_cert_id().unwrap_or("-").to_string();
                match orchestrator.submit_detached(request).await {
                    Ok(workflow_id) => info!("Renewal of {} dispatched as workflow {}", target, workflow_id),
                    Err(e) => error!("Failed to dispatch renewal of {}: {}", target, e),
                }
            }
        }));

        // Orphaned key reaper
        let reaper = self.orchestrator.reaper().clone();
        let period = self.config.scanner.interval;
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let report = reaper.collect(Utc::now()).await;
                for (key, reason) in &report.failed {
                    warn!("Orphaned key {} not destroyed: {}", key, reason);
                }
            }
        }));

        info!("Expiry scanner started, interval {:?}", period);
        Ok(())
    }

    pub async fn submit(&self, request: Request) -> Result<WorkflowOutcome> {
        self.orchestrator.submit(request).await
    }

    pub async fn submit_detached(&self, request: Request) -> Result<Uuid> {
        self.orchestrator.submit_detached(request).await
    }

    pub async fn submit_batch(&self, requests: Vec<Request>) -> Result<BatchReport> {
        self.batch.run(requests).await
    }

    pub async fn status(&self, workflow_id: Uuid) -> Result<WorkflowInstance> {
        self.orchestrator.status(workflow_id).await
    }

    pub async fn cancel(&self, workflow_id: Uuid) -> Result<WorkflowOutcome> {
        self.orchestrator.cancel(workflow_id).await
    }

    pub async fn resume(&self, resume_token: &str) -> Result<WorkflowOutcome> {
        self.orchestrator.resume(resume_token).await
    }

    /// Run one expiry scan now and dispatch its renewals in the background
    pub async fn scan_now(&self) -> Result<ExpiryReport> {
        let scan = self.scanner.scan(Utc::now()).await?;
        for request in scan.requests {
            self.orchestrator.submit_detached(request).await?;
        }
        Ok(scan.report)
    }

    pub async fn reap_orphans(&self) -> ReapReport {
        self.orchestrator.reaper().collect(Utc::now()).await
    }

    /// Policy rejections recorded in `[from, to]`, totalled by rule
    pub async fn compliance_report(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<ComplianceReport> {
        self.orchestrator.audit().compliance_report(from, to).await
    }

    pub async fn publish_policy(&self, document: PolicyDocument) -> Result<PolicySnapshot> {
        self.policies.publish(document).await
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn config(&self) -> &CertFlowConfig {
        &self.config
    }

    /// Stop background tasks. Workflows in flight keep their persisted state.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down certflow");

        let mut handles = self.task_handles.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }

        info!("certflow shut down");
        Ok(())
    }
}
