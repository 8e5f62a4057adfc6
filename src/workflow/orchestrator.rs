//! Workflow Orchestrator
//!
//! Drives each request through policy check, key acquisition, CSR
//! construction, CA submission and inventory recording (or CA revocation and
//! inventory recording). Every transition is audited before the instance moves
//! on, and the instance is persisted after every transition.

use std::sync::Arc;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditOutcome, AuditRecorder};
use crate::batch::CollaboratorGate;
use crate::collaborators::{CollaboratorKind, Collaborators};
use crate::config::CertFlowConfig;
use crate::errors::{CertFlowError, CollaboratorError, ErrorResponse, Result};
use crate::inventory::{CertificateRecord, CertificateStatus};
use crate::policy::{PolicyEvaluator, PolicySnapshot, PolicyStore};
use crate::retry::{RetryController, RetryObserver, RetryPolicy, StepFailure};
use super::{
    LockKey, OperationType, OrphanedKeyReaper, RequestKind, Request, StepKind, SubjectLocks,
    WorkflowInstance, WorkflowOutcome, WorkflowState, WorkflowStore,
};

/// Why a step stopped the pipeline
enum Halt {
    Fatal { step: StepKind, error: CollaboratorError, attempts: u32 },
    Exhausted { step: StepKind, error: CollaboratorError, attempts: u32 },
    /// Request can never succeed (missing or unsuitable target)
    Invalid { step: StepKind, error: CertFlowError },
    /// Audit or store failure; the instance stays at its last persisted state
    Interrupted(CertFlowError),
}

impl Halt {
    fn from_failure(step: StepKind, failure: StepFailure) -> Self {
        match failure {
            StepFailure::Fatal { error, attempts } => Halt::Fatal { step, error, attempts },
            StepFailure::Exhausted { last_error, attempts } => Halt::Exhausted { step, error: last_error, attempts },
            StepFailure::Observer(error) => Halt::Interrupted(error),
        }
    }

    fn internal(message: &str) -> Self {
        Halt::Interrupted(CertFlowError::Internal { message: message.to_string() })
    }
}

impl From<CertFlowError> for Halt {
    fn from(error: CertFlowError) -> Self {
        Halt::Interrupted(error)
    }
}

type StepResult = std::result::Result<(), Halt>;

/// Audits every failed collaborator attempt of one workflow
struct AttemptAuditor<'a> {
    audit: &'a AuditRecorder,
    workflow_id: Uuid,
    cert_id: Option<String>,
    policy_version: Option<String>,
    state: WorkflowState,
}

#[async_trait]
impl RetryObserver for AttemptAuditor<'_> {
    async fn attempt_failed(&self, step: StepKind, attempt: u32, error: &CollaboratorError) -> Result<()> {
        let outcome = if error.is_retryable() {
            AuditOutcome::TransientError
        } else {
            AuditOutcome::FatalError
        };

        let event = AuditEvent::new(self.workflow_id, step, outcome, self.state)
            .cert_id(self.cert_id.clone())
            .attempt(attempt)
            .policy_version(self.policy_version.clone())
            .details(json!({
                "collaborator": error.collaborator(),
                "error": error.to_string(),
            }));

        self.audit.record(event).await.map(|_| ())
    }
}

/// Per-run flags shared between the driving task and `cancel`
#[derive(Debug, Default)]
struct RunFlags {
    cancel_requested: bool,
    mutation_started: bool,
}

enum Claim {
    Existing(WorkflowOutcome),
    Fresh(WorkflowInstance),
}

pub struct Orchestrator {
    policies: Arc<dyn PolicyStore>,
    collaborators: Collaborators,
    audit: Arc<AuditRecorder>,
    store: Arc<dyn WorkflowStore>,
    retry: RetryController,
    gate: CollaboratorGate,
    locks: SubjectLocks,
    reaper: Arc<OrphanedKeyReaper>,
    /// Request idempotency key to workflow id
    claims: DashMap<String, Uuid>,
    /// Workflows currently driven by this process
    running: DashMap<Uuid, RunFlags>,
    max_resume_attempts: u32,
}

impl Orchestrator {
    pub fn new(
        config: &CertFlowConfig,
        policies: Arc<dyn PolicyStore>,
        collaborators: Collaborators,
        audit: Arc<AuditRecorder>,
        store: Arc<dyn WorkflowStore>,
    ) -> Self {
        let reaper = Arc::new(OrphanedKeyReaper::new(
            collaborators.key_custody.clone(),
            config.keys.orphan_retention,
        ));

        let gate = CollaboratorGate::new(config.batch.max_in_flight_per_collaborator);

        Self {
            policies,
            collaborators,
            audit,
            store,
            retry: RetryController::new(RetryPolicy::from(&config.retry)).with_gate(gate.clone()),
            gate,
            locks: SubjectLocks::new(),
            reaper,
            claims: DashMap::new(),
            running: DashMap::new(),
            max_resume_attempts: config.retry.max_resume_attempts,
        }
    }

    pub fn audit(&self) -> &Arc<AuditRecorder> {
        &self.audit
    }

    pub fn gate(&self) -> &CollaboratorGate {
        &self.gate
    }

    pub fn locks(&self) -> &SubjectLocks {
        &self.locks
    }

    pub fn reaper(&self) -> &Arc<OrphanedKeyReaper> {
        &self.reaper
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn retry(&self) -> &RetryController {
        &self.retry
    }

    /// Run `request` to a terminal or parked state.
    ///
    /// A request whose idempotency key was already submitted is not run again;
    /// the existing workflow's outcome is returned instead.
    pub async fn submit(&self, request: Request) -> Result<WorkflowOutcome> {
        match self.claim(request).await? {
            Claim::Existing(outcome) => Ok(outcome),
            Claim::Fresh(instance) => self.run(instance).await,
        }
    }

    /// Start `request` in the background and return its workflow id
    pub async fn submit_detached(self: &Arc<Self>, request: Request) -> Result<Uuid> {
        match self.claim(request).await? {
            Claim::Existing(outcome) => Ok(outcome.workflow_id),
            Claim::Fresh(instance) => {
                let workflow_id = instance.id;
                let orchestrator = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = orchestrator.run(instance).await {
                        debug!("Detached workflow {} ended with error: {}", workflow_id, e);
                    }
                });
                Ok(workflow_id)
            }
        }
    }

    pub async fn status(&self, workflow_id: Uuid) -> Result<WorkflowInstance> {
        self.store
            .get(workflow_id)
            .await?
            .ok_or_else(|| CertFlowError::WorkflowNotFound { workflow_id: workflow_id.to_string() })
    }

    pub async fn workflows(&self, state: Option<WorkflowState>) -> Result<Vec<WorkflowInstance>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|instance| state.map_or(true, |s| instance.state == s))
            .collect())
    }

    /// Cancel a workflow that has not yet begun CA submission or revocation.
    ///
    /// A workflow parked or stalled is cancelled at once. A workflow running in
    /// this process is cancelled at its next step boundary; the returned
    /// outcome then still shows its current state.
    pub async fn cancel(&self, workflow_id: Uuid) -> Result<WorkflowOutcome> {
        // Decide under the entry lock; nothing below may hold it across an await
        let (reserved, rejected) = match self.running.entry(workflow_id) {
            Entry::Occupied(mut flags) => {
                if flags.get().mutation_started {
                    (false, true)
                } else {
                    flags.get_mut().cancel_requested = true;
                    (false, false)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(RunFlags { cancel_requested: true, mutation_started: false });
                (true, false)
            }
        };

        if rejected {
            let instance = self.status(workflow_id).await?;
            return Err(CertFlowError::CancellationRejected { workflow_id, state: instance.state });
        }

        let result = self.cancel_reserved(workflow_id, reserved).await;
        if reserved {
            self.running.remove(&workflow_id);
        }
        result
    }

    async fn cancel_reserved(&self, workflow_id: Uuid, reserved: bool) -> Result<WorkflowOutcome> {
        let mut instance = self.status(workflow_id).await?;
        if !instance.is_cancellable() {
            if !reserved {
                if let Some(mut flags) = self.running.get_mut(&workflow_id) {
                    flags.cancel_requested = false;
                }
            }
            return Err(CertFlowError::CancellationRejected { workflow_id, state: instance.state });
        }

        if !reserved {
            info!("Cancellation requested for running workflow {}", workflow_id);
            return Ok(WorkflowOutcome::from(&instance));
        }

        self.cancel_now(&mut instance).await
    }

    /// Resume a workflow parked in STEP_FAILED
    pub async fn resume(&self, resume_token: &str) -> Result<WorkflowOutcome> {
        let not_found = || CertFlowError::WorkflowNotFound { workflow_id: resume_token.to_string() };
        let workflow_id = resume_token
            .split('.')
            .next()
            .and_then(|id| Uuid::parse_str(id).ok())
            .ok_or_else(not_found)?;

        match self.running.entry(workflow_id) {
            Entry::Occupied(_) => {
                return Err(CertFlowError::NotResumable { workflow_id, state: WorkflowState::Received });
            }
            Entry::Vacant(slot) => {
                slot.insert(RunFlags::default());
            }
        }

        let result = self.resume_reserved(workflow_id, resume_token).await;
        self.running.remove(&workflow_id);
        result
    }

    async fn resume_reserved(&self, workflow_id: Uuid, resume_token: &str) -> Result<WorkflowOutcome> {
        let mut instance = self.status(workflow_id).await?;
        if instance.state != WorkflowState::StepFailed || instance.resume_token.as_deref() != Some(resume_token) {
            return Err(CertFlowError::NotResumable { workflow_id, state: instance.state });
        }

        let step = instance.failed_step.unwrap_or(StepKind::PolicyCheck);
        let previous = instance.parked_from.unwrap_or(WorkflowState::Received);

        instance.resume_count += 1;
        instance.resume_token = None;
        instance.failed_step = None;
        instance.parked_from = None;
        instance.error = None;

        let details = json!({ "resume_count": instance.resume_count });
        self.transition(&mut instance, step, AuditOutcome::Resumed, previous, 0, details).await?;
        info!("Workflow {} resumed at {} (resume {})", workflow_id, step, instance.resume_count);

        Self::revalidate_target(&mut instance);
        self.continue_run(&mut instance).await
    }

    /// Resume every non-terminal, non-parked workflow left by a previous process.
    ///
    /// Parked workflows are not run, but get their single-writer lock back.
    pub async fn recover(&self) -> Result<Vec<std::result::Result<WorkflowOutcome, ErrorResponse>>> {
        let instances = self.store.list().await?;
        for parked in instances.iter().filter(|instance| instance.state == WorkflowState::StepFailed) {
            if let Some(key) = self.lock_key(parked) {
                self.locks.restore(key, parked.id);
            }
        }

        let mut outcomes = Vec::new();
        for mut instance in instances {
            if instance.state.is_terminal() || instance.state == WorkflowState::StepFailed {
                continue;
            }
            match self.running.entry(instance.id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(RunFlags::default());
                }
            }
            self.claims.insert(instance.request.idempotency_key.clone(), instance.id);

            info!("Recovering workflow {} from state {}", instance.id, instance.state);
            Self::revalidate_target(&mut instance);
            let result = self.continue_run(&mut instance).await;
            self.running.remove(&instance.id);
            outcomes.push(result.map_err(|e| ErrorResponse::new(&e)));
        }

        Ok(outcomes)
    }

    async fn claim(&self, request: Request) -> Result<Claim> {
        let key = request.idempotency_key.clone();
        if let Some(existing) = self.existing_for(&key, request.operation()).await? {
            debug!("Request {} already submitted as workflow {}", key, existing.workflow_id);
            return Ok(Claim::Existing(existing));
        }

        let instance = WorkflowInstance::new(request);
        let raced = match self.claims.entry(key.clone()) {
            Entry::Occupied(existing) => Some(*existing.get()),
            Entry::Vacant(slot) => {
                slot.insert(instance.id);
                None
            }
        };
        if let Some(workflow_id) = raced {
            let outcome = self.existing_for(&key, instance.operation()).await?;
            return Ok(Claim::Existing(
                outcome.unwrap_or_else(|| Self::pending_outcome(workflow_id, instance.operation())),
            ));
        }
        self.running.insert(instance.id, RunFlags::default());

        if let Err(e) = self.store.save(&instance).await {
            self.claims.remove(&key);
            self.running.remove(&instance.id);
            return Err(e);
        }

        info!("Workflow {} received: {} by {}", instance.id, instance.operation(), instance.request.requester_role);
        Ok(Claim::Fresh(instance))
    }

    async fn existing_for(&self, key: &str, operation: OperationType) -> Result<Option<WorkflowOutcome>> {
        let claimed = self.claims.get(key).map(|entry| *entry.value());
        let instance = match claimed {
            Some(workflow_id) => match self.store.get(workflow_id).await? {
                Some(instance) => Some(instance),
                None => return Ok(Some(Self::pending_outcome(workflow_id, operation))),
            },
            None => self.store.find_by_idempotency_key(key).await?,
        };

        match instance {
            Some(instance) if instance.conflict_aborted => {
                self.claims.remove_if(key, |_, id| *id == instance.id);
                Ok(None)
            }
            Some(instance) => {
                if instance.state.is_terminal() {
                    self.claims.remove_if(key, |_, id| *id == instance.id);
                } else {
                    self.claims.entry(key.to_string()).or_insert(instance.id);
                }
                Ok(Some(WorkflowOutcome::from(&instance)))
            }
            None => Ok(None),
        }
    }

    fn pending_outcome(workflow_id: Uuid, operation: OperationType) -> WorkflowOutcome {
        WorkflowOutcome {
            workflow_id,
            operation,
            state: WorkflowState::Received,
            policy_version: None,
            cert_id: None,
            serial: None,
            expires_at: None,
            resume_token: None,
            error: None,
        }
    }

    async fn run(&self, mut instance: WorkflowInstance) -> Result<WorkflowOutcome> {
        let result = self.continue_run(&mut instance).await;
        self.running.remove(&instance.id);
        result
    }

    async fn continue_run(&self, instance: &mut WorkflowInstance) -> Result<WorkflowOutcome> {
        if instance.state == WorkflowState::Received {
            let snapshot = match self.policies.load(Utc::now()).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    let details = json!({ "error": e.to_string() });
                    return Err(self.abort(instance, StepKind::PolicyCheck, e, details).await);
                }
            };
            self.check_policy(instance, &snapshot).await?;
        } else if let Some(version) = instance.policy_version.clone() {
            // Re-bind the snapshot captured at the policy check
            if self.policies.get_version(&version).await?.is_none() {
                let e = CertFlowError::PolicyUnavailable { at: format!("version {}", version) };
                let step = instance.next_step().unwrap_or(StepKind::PolicyCheck);
                let details = json!({ "error": e.to_string() });
                return Err(self.abort(instance, step, e, details).await);
            }
            debug!("Workflow {} continues under policy v{}", instance.id, version);
        }

        self.drive(instance).await
    }

    async fn check_policy(&self, instance: &mut WorkflowInstance, snapshot: &PolicySnapshot) -> Result<()> {
        let decision = PolicyEvaluator::evaluate(&instance.request, snapshot);
        instance.policy_version = Some(decision.policy_version.clone());
        instance.results.decision = Some(decision.clone());

        let details = json!({
            "approved": decision.approved,
            "rule_id": decision.rule_id,
            "reason": decision.reason,
        });

        if decision.approved {
            info!("Workflow {} approved under policy v{}", instance.id, decision.policy_version);
            return self
                .transition(instance, StepKind::PolicyCheck, AuditOutcome::Success, WorkflowState::PolicyChecked, 0, details)
                .await;
        }

        let rule_id = decision.rule_id.map(|id| id.to_string()).unwrap_or_default();
        warn!("Workflow {} rejected by rule {}: {}", instance.id, rule_id, decision.reason);

        let violation = CertFlowError::PolicyViolation {
            rule_id,
            message: decision.reason.clone(),
            policy_version: decision.policy_version.clone(),
        };
        instance.error = Some(ErrorResponse::new(&violation));
        self.transition(
            instance,
            StepKind::PolicyCheck,
            AuditOutcome::PolicyRejected,
            WorkflowState::PolicyRejected,
            0,
            details,
        )
        .await?;

        Err(violation)
    }

    async fn drive(&self, instance: &mut WorkflowInstance) -> Result<WorkflowOutcome> {
        if let Err(halt) = self.resolve_target(instance).await {
            return Err(self.handle_halt(instance, halt).await);
        }

        let lock_key = match self.lock_key(instance) {
            Some(key) => key,
            None => return Err(self.handle_halt(instance, Halt::internal("workflow has no lock subject")).await),
        };

        let guard = match self.locks.try_acquire(lock_key, instance.id) {
            Ok(guard) => guard,
            Err(conflict) => {
                instance.conflict_aborted = true;
                let step = instance.next_step().unwrap_or(StepKind::PolicyCheck);
                let details = json!({ "error": conflict.to_string() });
                return Err(self.abort(instance, step, conflict, details).await);
            }
        };

        while let Some(step) = instance.next_step() {
            if self.cancel_due(instance.id, step) {
                return self.cancel_now(instance).await;
            }

            let result = match step {
                StepKind::KeyAcquisition => self.acquire_key(instance).await,
                StepKind::CsrConstruction => self.construct_csr(instance).await,
                StepKind::CaSubmission => self.submit_to_ca(instance).await,
                StepKind::Revocation => self.revoke_at_ca(instance).await,
                StepKind::InventoryRecording => self.record_inventory(instance).await,
                StepKind::PolicyCheck => Err(Halt::internal("policy check reached after approval")),
            };

            if let Err(halt) = result {
                let error = self.handle_halt(instance, halt).await;
                if !instance.state.is_terminal() {
                    // Parked or interrupted: the subject stays locked until a terminal state
                    guard.retain();
                }
                return Err(error);
            }
        }

        if instance.state == WorkflowState::InventoryRecorded {
            instance.state = WorkflowState::Completed;
            instance.updated_at = Utc::now();
            self.store.save(instance).await?;
            self.settle(instance);
            info!(
                "Workflow {} completed: {} {}",
                instance.id,
                instance.operation(),
                instance.results.cert_id.as_deref().unwrap_or("-")
            );
        }

        Ok(WorkflowOutcome::from(&*instance))
    }

    /// Checks a pending cancellation and marks remote mutation as begun
    fn cancel_due(&self, workflow_id: Uuid, step: StepKind) -> bool {
        match self.running.get_mut(&workflow_id) {
            Some(mut flags) => {
                if flags.cancel_requested && !flags.mutation_started {
                    return true;
                }
                if step.is_remote_mutation() {
                    flags.mutation_started = true;
                }
                false
            }
            None => false,
        }
    }

    fn lock_key(&self, instance: &WorkflowInstance) -> Option<LockKey> {
        match &instance.request.kind {
            RequestKind::Issue { profile } => Some(LockKey::new(&profile.subject, None)),
            RequestKind::Renew { .. } | RequestKind::Revoke { .. } => instance
                .results
                .target
                .as_ref()
                .map(|target| LockKey::new(&target.subject, Some(target.key_reference.clone()))),
        }
    }

    fn observer(&self, instance: &WorkflowInstance) -> AttemptAuditor<'_> {
        AttemptAuditor {
            audit: &self.audit,
            workflow_id: instance.id,
            cert_id: Self::audit_cert_id(instance),
            policy_version: instance.policy_version.clone(),
            state: instance.state,
        }
    }

    fn audit_cert_id(instance: &WorkflowInstance) -> Option<String> {
        instance
            .results
            .cert_id
            .clone()
            .or_else(|| instance.request.target_cert_id().map(str::to_string))
    }

    /// Audit, then advance and persist
    async fn transition(
        &self,
        instance: &mut WorkflowInstance,
        step: StepKind,
        outcome: AuditOutcome,
        next: WorkflowState,
        attempt: u32,
        details: serde_json::Value,
    ) -> Result<()> {
        let event = AuditEvent::new(instance.id, step, outcome, next)
            .cert_id(Self::audit_cert_id(instance))
            .attempt(attempt)
            .policy_version(instance.policy_version.clone())
            .details(details);
        self.audit.record(event).await?;

        debug!("Workflow {}: {} -> {}", instance.id, instance.state, next);
        instance.state = next;
        instance.updated_at = Utc::now();
        self.store.save(instance).await?;

        if next.is_terminal() {
            self.settle(instance);
        }
        Ok(())
    }

    /// Release what a workflow held while live. The store answers later resubmissions.
    fn settle(&self, instance: &WorkflowInstance) {
        let key = &instance.request.idempotency_key;
        self.locks.release_all(instance.id);
        self.claims.remove_if(key, |_, id| *id == instance.id);
        let evicted = self.retry.index().forget_prefix(&format!("{}:", key));
        debug!("Workflow {} settled in {}, {} step outcomes evicted", instance.id, instance.state, evicted);
    }

    /// Drop a cached target so it is looked up and checked again before any
    /// remote mutation. Kept once the CA has acted on it.
    fn revalidate_target(instance: &mut WorkflowInstance) {
        let results = &mut instance.results;
        if results.issued.is_none() && results.revocation.is_none() {
            results.target = None;
        }
    }

    fn count_attempts(instance: &mut WorkflowInstance, step: StepKind, attempts: u32) {
        *instance.retry_counts.entry(step).or_insert(0) += attempts;
    }

    async fn handle_halt(&self, instance: &mut WorkflowInstance, halt: Halt) -> CertFlowError {
        match halt {
            Halt::Fatal { step, error, attempts } => {
                Self::count_attempts(instance, step, attempts);
                let details = json!({ "error": error.to_string(), "attempts": attempts });
                let fatal = CertFlowError::FatalCollaborator {
                    error,
                    policy_version: instance.policy_version.clone(),
                    workflow_id: Some(instance.id),
                };
                self.abort(instance, step, fatal, details).await
            }
            Halt::Exhausted { step, error, attempts } => {
                Self::count_attempts(instance, step, attempts);
                if instance.resume_count >= self.max_resume_attempts {
                    warn!("Workflow {} used all {} resumes; aborting", instance.id, self.max_resume_attempts);
                    let details = json!({
                        "error": error.to_string(),
                        "attempts": attempts,
                        "resume_count": instance.resume_count,
                    });
                    let fatal = CertFlowError::FatalCollaborator {
                        error,
                        policy_version: instance.policy_version.clone(),
                        workflow_id: Some(instance.id),
                    };
                    self.abort(instance, step, fatal, details).await
                } else {
                    self.park(instance, step, error, attempts).await
                }
            }
            Halt::Invalid { step, error } => {
                let details = json!({ "error": error.to_string() });
                self.abort(instance, step, error, details).await
            }
            Halt::Interrupted(e) => {
                error!("Workflow {} interrupted in state {}: {}", instance.id, instance.state, e);
                e
            }
        }
    }

    /// Move to ABORTED; returns `cause`, or the audit/store error if that fails
    async fn abort(
        &self,
        instance: &mut WorkflowInstance,
        step: StepKind,
        cause: CertFlowError,
        details: serde_json::Value,
    ) -> CertFlowError {
        instance.error = Some(ErrorResponse::new(&cause));
        if let Err(e) = self
            .transition(instance, step, AuditOutcome::Aborted, WorkflowState::Aborted, 0, details)
            .await
        {
            error!("Workflow {} could not record abort: {}", instance.id, e);
            return e;
        }

        warn!("Workflow {} aborted at {}: {}", instance.id, step, cause);
        self.orphan_unused_key(instance);
        cause
    }

    async fn park(
        &self,
        instance: &mut WorkflowInstance,
        step: StepKind,
        error: CollaboratorError,
        attempts: u32,
    ) -> CertFlowError {
        let token = format!("{}.{}", instance.id.simple(), hex::encode(rand::random::<[u8; 8]>()));
        let exhausted = CertFlowError::ExhaustedRetries {
            workflow_id: instance.id,
            step,
            attempts,
            resume_token: token.clone(),
            last_error: error.to_string(),
            policy_version: instance.policy_version.clone(),
        };

        instance.failed_step = Some(step);
        instance.parked_from = Some(instance.state);
        instance.resume_token = Some(token);
        instance.error = Some(ErrorResponse::new(&exhausted));

        let details = json!({ "last_error": error.to_string(), "attempts": attempts });
        if let Err(e) = self
            .transition(instance, step, AuditOutcome::Parked, WorkflowState::StepFailed, attempts, details)
            .await
        {
            error!("Workflow {} could not record parking: {}", instance.id, e);
            return e;
        }

        warn!("Workflow {} parked at {} after {} attempts", instance.id, step, attempts);
        exhausted
    }

    async fn cancel_now(&self, instance: &mut WorkflowInstance) -> Result<WorkflowOutcome> {
        let step = instance.next_step().unwrap_or(StepKind::PolicyCheck);
        instance.resume_token = None;
        instance.error = None;

        self.transition(instance, step, AuditOutcome::Cancelled, WorkflowState::Cancelled, 0, json!({}))
            .await?;
        info!("Workflow {} cancelled before {}", instance.id, step);

        self.orphan_unused_key(instance);
        Ok(WorkflowOutcome::from(&*instance))
    }

    /// Hand a key this workflow created, but never certified, to the reaper
    fn orphan_unused_key(&self, instance: &WorkflowInstance) {
        let results = &instance.results;
        if !results.key_generated || results.issued.is_some() {
            return;
        }
        if let Some(key) = &results.key_reference {
            self.reaper.register(key.clone(), instance.id, Utc::now());
        }
    }

    async fn resolve_target(&self, instance: &mut WorkflowInstance) -> StepResult {
        let Some(cert_id) = instance.request.target_cert_id().map(str::to_string) else {
            return Ok(());
        };
        if instance.results.target.is_some() {
            return Ok(());
        }

        let step = instance.next_step().unwrap_or(StepKind::KeyAcquisition);
        let observer = self.observer(instance);
        let inventory = &self.collaborators.inventory;
        let id = cert_id.as_str();

        let lookup = self
            .retry
            .execute_read(&instance.step_key("target_lookup"), step, CollaboratorKind::Inventory, &observer, move || async move {
                inventory.get_certificate(id).await
            })
            .await
            .map_err(|failure| Halt::from_failure(step, failure))?;

        let invalid = |reason: &str| Halt::Invalid {
            step,
            error: CertFlowError::InvalidTarget {
                cert_id: cert_id.clone(),
                reason: reason.to_string(),
                policy_version: instance.policy_version.clone(),
            },
        };

        let record = match lookup.value {
            Some(record) => record,
            None => {
                return Err(Halt::Invalid {
                    step,
                    error: CertFlowError::CertificateNotFound { cert_id: cert_id.clone() },
                })
            }
        };

        match &instance.request.kind {
            RequestKind::Renew { current_expires_at, profile, .. } => {
                if !record.is_current() {
                    return Err(invalid("certificate is no longer current"));
                }
                if record.expires_at != *current_expires_at {
                    return Err(invalid("request does not match the inventory record"));
                }
                if !profile.renews(&record) {
                    return Err(invalid("renewal must keep the certificate's subject, SANs and key type"));
                }
            }
            RequestKind::Revoke { .. } => {
                if record.status != CertificateStatus::Active {
                    return Err(invalid(&format!("certificate is already {}", record.status)));
                }
            }
            RequestKind::Issue { .. } => {}
        }

        instance.results.target = Some(record);
        self.store.save(instance).await?;
        Ok(())
    }

    async fn acquire_key(&self, instance: &mut WorkflowInstance) -> StepResult {
        let step = StepKind::KeyAcquisition;
        let custody = &self.collaborators.key_custody;
        let mut attempts = 0;

        if instance.results.key_reference.is_none() {
            let observer = self.observer(instance);
            let (key, generated) = match &instance.request.kind {
                RequestKind::Issue { profile } => {
                    let spec = &profile.key_spec;
                    let outcome = self
                        .retry
                        .execute(&instance.step_key("key_generation"), step, CollaboratorKind::KeyCustody, &observer, move || async move {
                            custody.generate(spec).await
                        })
                        .await
                        .map_err(|failure| Halt::from_failure(step, failure))?;
                    attempts = outcome.attempts;
                    (outcome.value, true)
                }
                RequestKind::Renew { rotate_key, .. } => {
                    let target = instance
                        .results
                        .target
                        .as_ref()
                        .ok_or_else(|| Halt::internal("renewal without a resolved target"))?;

                    if *rotate_key {
                        let current = &target.key_reference;
                        let outcome = self
                            .retry
                            .execute(&instance.step_key("key_rotation"), step, CollaboratorKind::KeyCustody, &observer, move || async move {
                                custody.rotate(current).await
                            })
                            .await
                            .map_err(|failure| Halt::from_failure(step, failure))?;
                        attempts = outcome.attempts;
                        (outcome.value, true)
                    } else {
                        (target.key_reference.clone(), false)
                    }
                }
                RequestKind::Revoke { .. } => return Err(Halt::internal("revocation has no key step")),
            };

            instance.results.key_reference = Some(key);
            instance.results.key_generated = generated;
            self.store.save(instance).await?;
        }

        let key = instance
            .results
            .key_reference
            .clone()
            .ok_or_else(|| Halt::internal("key reference missing after acquisition"))?;
        let observer = self.observer(instance);
        let key_ref = &key;

        let public_key = self
            .retry
            .execute(&instance.step_key("public_key"), step, CollaboratorKind::KeyCustody, &observer, move || async move {
                custody.get_public_key(key_ref).await
            })
            .await
            .map_err(|failure| Halt::from_failure(step, failure))?;
        attempts = attempts.max(public_key.attempts);

        instance.results.public_key = Some(public_key.value);
        Self::count_attempts(instance, step, attempts);

        let details = json!({
            "key_reference": key,
            "generated": instance.results.key_generated,
        });
        self.transition(instance, step, AuditOutcome::Success, WorkflowState::KeyReady, attempts, details)
            .await?;
        Ok(())
    }

    async fn construct_csr(&self, instance: &mut WorkflowInstance) -> StepResult {
        let step = StepKind::CsrConstruction;
        let builder = &self.collaborators.csr_builder;
        let observer = self.observer(instance);

        let profile = instance
            .request
            .profile()
            .ok_or_else(|| Halt::internal("CSR requested without a certificate profile"))?;
        let public_key = instance
            .results
            .public_key
            .as_deref()
            .ok_or_else(|| Halt::internal("CSR requested before key acquisition"))?;

        let outcome = self
            .retry
            .execute(&instance.step_key("csr_construction"), step, CollaboratorKind::CsrBuilder, &observer, move || async move {
                builder.build(&profile.subject, &profile.sans, public_key, &profile.key_usage).await
            })
            .await
            .map_err(|failure| Halt::from_failure(step, failure))?;

        let details = json!({ "csr_bytes": outcome.value.len() });
        instance.results.csr = Some(outcome.value);
        Self::count_attempts(instance, step, outcome.attempts);

        self.transition(instance, step, AuditOutcome::Success, WorkflowState::CsrReady, outcome.attempts, details)
            .await?;
        Ok(())
    }

    async fn submit_to_ca(&self, instance: &mut WorkflowInstance) -> StepResult {
        let step = StepKind::CaSubmission;
        let authority = &self.collaborators.authority;
        let observer = self.observer(instance);

        let validity_days = instance
            .request
            .profile()
            .map(|profile| profile.validity_days)
            .ok_or_else(|| Halt::internal("CA submission without a certificate profile"))?;
        let csr = instance
            .results
            .csr
            .as_deref()
            .ok_or_else(|| Halt::internal("CA submission before CSR construction"))?;

        let key = instance.step_key("ca_submission");
        let idempotency_key = key.as_str();

        let outcome = self
            .retry
            .execute_with_probe(
                idempotency_key,
                step,
                CollaboratorKind::CertificateAuthority,
                &observer,
                move || async move {
                    authority.find_issued(idempotency_key).await
                },
                move || async move {
                    authority.issue(csr, validity_days, idempotency_key).await
                },
            )
            .await
            .map_err(|failure| Halt::from_failure(step, failure))?;

        let certificate = outcome.value;
        let details = json!({
            "serial": certificate.serial,
            "not_after": certificate.not_after,
            "reused": outcome.reused,
        });
        info!("Workflow {} issued serial {}", instance.id, certificate.serial);

        instance.results.cert_id = Some(instance.issued_cert_id());
        instance.results.issued = Some(certificate);
        Self::count_attempts(instance, step, outcome.attempts);

        self.transition(instance, step, AuditOutcome::Success, WorkflowState::CertIssued, outcome.attempts, details)
            .await?;
        Ok(())
    }

    async fn revoke_at_ca(&self, instance: &mut WorkflowInstance) -> StepResult {
        let step = StepKind::Revocation;
        let authority = &self.collaborators.authority;
        let observer = self.observer(instance);

        let (serial, reason) = match (&instance.request.kind, &instance.results.target) {
            (RequestKind::Revoke { reason, .. }, Some(target)) => (target.serial.as_str(), reason.as_str()),
            _ => return Err(Halt::internal("revocation without a resolved target")),
        };

        let outcome = self
            .retry
            .execute(&instance.step_key("revocation"), step, CollaboratorKind::CertificateAuthority, &observer, move || async move {
                authority.revoke(serial, reason).await
            })
            .await
            .map_err(|failure| Halt::from_failure(step, failure))?;

        let ack = outcome.value;
        let details = json!({ "serial": ack.serial, "reason": ack.reason, "revoked_at": ack.revoked_at });
        info!("Workflow {} revoked serial {} ({})", instance.id, ack.serial, ack.reason);

        instance.results.revocation = Some(ack);
        Self::count_attempts(instance, step, outcome.attempts);

        self.transition(instance, step, AuditOutcome::Success, WorkflowState::CertRevoked, outcome.attempts, details)
            .await?;
        Ok(())
    }

    async fn record_inventory(&self, instance: &mut WorkflowInstance) -> StepResult {
        let step = StepKind::InventoryRecording;
        let inventory = &self.collaborators.inventory;
        let observer = self.observer(instance);

        let (attempts, details) = if let RequestKind::Revoke { reason, .. } = &instance.request.kind {
            let target = instance
                .results
                .target
                .as_ref()
                .ok_or_else(|| Halt::internal("revocation without a resolved target"))?;
            let cert_id = target.cert_id.as_str();

            let outcome = self
                .retry
                .execute(&instance.step_key("inventory_status"), step, CollaboratorKind::Inventory, &observer, move || async move {
                    inventory.update_status(cert_id, CertificateStatus::Revoked, reason).await
                })
                .await
                .map_err(|failure| Halt::from_failure(step, failure))?;

            let details = json!({ "cert_id": cert_id, "status": outcome.value.status });
            instance.results.cert_id = Some(target.cert_id.clone());
            (outcome.attempts, details)
        } else {
            let record = self.issued_record(instance)?;
            let record_ref = &record;

            let upsert = self
                .retry
                .execute(&instance.step_key("inventory_upsert"), step, CollaboratorKind::Inventory, &observer, move || async move {
                    inventory.upsert_certificate(record_ref).await
                })
                .await
                .map_err(|failure| Halt::from_failure(step, failure))?;
            let mut attempts = upsert.attempts;

            if let Some(predecessor) = record.renewed_from.as_deref() {
                let successor = record.cert_id.as_str();
                let superseded = self
                    .retry
                    .execute(&instance.step_key("inventory_supersede"), step, CollaboratorKind::Inventory, &observer, move || async move {
                        inventory.mark_superseded(predecessor, successor).await
                    })
                    .await
                    .map_err(|failure| Halt::from_failure(step, failure))?;
                attempts = attempts.max(superseded.attempts);
            }

            let details = json!({
                "cert_id": record.cert_id,
                "serial": record.serial,
                "expires_at": record.expires_at,
                "renewed_from": record.renewed_from,
            });
            (attempts, details)
        };

        Self::count_attempts(instance, step, attempts);
        self.transition(instance, step, AuditOutcome::Success, WorkflowState::InventoryRecorded, attempts, details)
            .await?;
        Ok(())
    }

    fn issued_record(&self, instance: &WorkflowInstance) -> std::result::Result<CertificateRecord, Halt> {
        let results = &instance.results;
        let profile = instance
            .request
            .profile()
            .ok_or_else(|| Halt::internal("inventory recording without a certificate profile"))?;
        let issued = results
            .issued
            .as_ref()
            .ok_or_else(|| Halt::internal("inventory recording before issuance"))?;
        let key_reference = results
            .key_reference
            .clone()
            .ok_or_else(|| Halt::internal("inventory recording without a key"))?;

        Ok(CertificateRecord {
            cert_id: instance.issued_cert_id(),
            subject: profile.subject.clone(),
            sans: profile.sans.clone(),
            serial: issued.serial.clone(),
            key_reference,
            key_spec: profile.key_spec.clone(),
            key_usage: profile.key_usage.clone(),
            validity_days: profile.validity_days,
            issued_at: issued.not_before,
            expires_at: issued.not_after,
            status: CertificateStatus::Active,
            policy_version: instance.policy_version.clone().unwrap_or_default(),
            renewed_from: results.target.as_ref().map(|target| target.cert_id.clone()),
            superseded_by: None,
            revocation_reason: None,
            status_changed_at: None,
            workflow_id: instance.id,
        })
    }
}
