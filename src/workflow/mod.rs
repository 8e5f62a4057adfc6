//! Certificate Lifecycle Workflows
//!
//! Requests, workflow instances and the state machine vocabulary shared by the
//! orchestrator, the audit trail and the workflow stores.

use std::collections::BTreeMap;
use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};
use uuid::Uuid;

use crate::collaborators::{IssuedCertificate, KeyReference, KeySpec, KeyUsageProfile, RevocationAck};
use crate::errors::ErrorResponse;
use crate::inventory::CertificateRecord;
use crate::policy::Decision;

pub mod lock;
pub mod orchestrator;
pub mod orphans;
pub mod store;


pub use lock::{LockGuard, LockKey, SubjectLocks};
pub use orchestrator::Orchestrator;
pub use orphans::{OrphanedKey, OrphanedKeyReaper, ReapReport};
pub use store::{FileWorkflowStore, InMemoryWorkflowStore, WorkflowStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Issue,
    Renew,
    Revoke,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::Issue => "issue",
            OperationType::Renew => "renew",
            OperationType::Revoke => "revoke",
        };
        f.write_str(name)
    }
}

/// Requested certificate parameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateProfile {
    /// Subject common name
    pub subject: String,
    pub sans: Vec<String>,
    pub key_spec: KeySpec,
    pub validity_days: u32,
    pub key_usage: KeyUsageProfile,
}

impl CertificateProfile {
    /// TLS server profile for `subject`, with the subject as the only SAN
    pub fn tls_server(subject: &str, key_spec: KeySpec, validity_days: u32) -> Self {
        Self {
            subject: subject.to_string(),
            sans: vec![subject.to_string()],
            key_spec,
            validity_days,
            key_usage: KeyUsageProfile::tls_server(),
        }
    }

    /// Profile reproducing an existing certificate
    pub fn from_record(record: &CertificateRecord) -> Self {
        Self {
            subject: record.subject.clone(),
            sans: record.sans.clone(),
            key_spec: record.key_spec.clone(),
            validity_days: record.validity_days,
            key_usage: record.key_usage.clone(),
        }
    }

    /// Whether a renewal with this profile would certify the same identity and
    /// key type as `record`. SAN order is ignored.
    pub fn renews(&self, record: &CertificateRecord) -> bool {
        let normalized = |sans: &[String]| {
            let mut sans: Vec<String> = sans.iter().map(|san| san.to_ascii_lowercase()).collect();
            sans.sort();
            sans.dedup();
            sans
        };

        self.subject.eq_ignore_ascii_case(&record.subject)
            && normalized(&self.sans) == normalized(&record.sans)
            && self.key_spec == record.key_spec
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum RequestKind {
    Issue {
        profile: CertificateProfile,
    },
    Renew {
        target_cert_id: String,
        profile: CertificateProfile,
        /// Expiry of the certificate being renewed, as known to the requester
        current_expires_at: DateTime<Utc>,
        /// Replace the key instead of reusing the predecessor's
        rotate_key: bool,
    },
    Revoke {
        target_cert_id: String,
        reason: String,
    },
}

/// Lifecycle request as submitted to the orchestrator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: Uuid,
    pub kind: RequestKind,
    pub requester_role: String,
    pub idempotency_key: String,
    pub submitted_at: DateTime<Utc>,
}

impl Request {
    fn new(kind: RequestKind, requester_role: &str) -> Self {
        let request_id = Uuid::new_v4();
        let idempotency_key = Self::derive_key(request_id, &kind, requester_role);
        Self {
            request_id,
            kind,
            requester_role: requester_role.to_string(),
            idempotency_key,
            submitted_at: Utc::now(),
        }
    }

    pub fn issue(profile: CertificateProfile, requester_role: &str) -> Self {
        Self::new(RequestKind::Issue { profile }, requester_role)
    }

    pub fn renew(
        target_cert_id: &str,
        profile: CertificateProfile,
        current_expires_at: DateTime<Utc>,
        rotate_key: bool,
        requester_role: &str,
    ) -> Self {
        Self::new(
            RequestKind::Renew {
                target_cert_id: target_cert_id.to_string(),
                profile,
                current_expires_at,
                rotate_key,
            },
            requester_role,
        )
    }

    /// Renewal reproducing `record`'s profile
    pub fn renewal_of(record: &CertificateRecord, rotate_key: bool, requester_role: &str) -> Self {
        Self::renew(
            &record.cert_id,
            CertificateProfile::from_record(record),
            record.expires_at,
            rotate_key,
            requester_role,
        )
    }

    pub fn revoke(target_cert_id: &str, reason: &str, requester_role: &str) -> Self {
        Self::new(
            RequestKind::Revoke {
                target_cert_id: target_cert_id.to_string(),
                reason: reason.to_string(),
            },
            requester_role,
        )
    }

    /// Replace the derived idempotency key with a caller-supplied one
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    /// Derived keys are scoped to one request: resubmitting it (or a clone of
    /// it) is deduplicated, while a newly built request with the same content
    /// starts a new workflow. Callers wanting content-level dedup supply a key.
    fn derive_key(request_id: Uuid, kind: &RequestKind, requester_role: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request_id.as_bytes());
        hasher.update(serde_json::to_vec(kind).unwrap_or_default());
        hasher.update(requester_role.as_bytes());
        format!("req-{}", &hex::encode(hasher.finalize())[..32])
    }

    pub fn operation(&self) -> OperationType {
        match self.kind {
            RequestKind::Issue { .. } => OperationType::Issue,
            RequestKind::Renew { .. } => OperationType::Renew,
            RequestKind::Revoke { .. } => OperationType::Revoke,
        }
    }

    pub fn profile(&self) -> Option<&CertificateProfile> {
        match &self.kind {
            RequestKind::Issue { profile } | RequestKind::Renew { profile, .. } => Some(profile),
            RequestKind::Revoke { .. } => None,
        }
    }

    pub fn target_cert_id(&self) -> Option<&str> {
        match &self.kind {
            RequestKind::Issue { .. } => None,
            RequestKind::Renew { target_cert_id, .. } | RequestKind::Revoke { target_cert_id, .. } => {
                Some(target_cert_id)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Received,
    PolicyChecked,
    KeyReady,
    CsrReady,
    CertIssued,
    CertRevoked,
    InventoryRecorded,
    Completed,
    PolicyRejected,
    StepFailed,
    Aborted,
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed
                | WorkflowState::PolicyRejected
                | WorkflowState::Aborted
                | WorkflowState::Cancelled
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowState::Received => "received",
            WorkflowState::PolicyChecked => "policy_checked",
            WorkflowState::KeyReady => "key_ready",
            WorkflowState::CsrReady => "csr_ready",
            WorkflowState::CertIssued => "cert_issued",
            WorkflowState::CertRevoked => "cert_revoked",
            WorkflowState::InventoryRecorded => "inventory_recorded",
            WorkflowState::Completed => "completed",
            WorkflowState::PolicyRejected => "policy_rejected",
            WorkflowState::StepFailed => "step_failed",
            WorkflowState::Aborted => "aborted",
            WorkflowState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    PolicyCheck,
    KeyAcquisition,
    CsrConstruction,
    CaSubmission,
    Revocation,
    InventoryRecording,
}

impl StepKind {
    /// Steps that change state at the certificate authority; nothing may be
    /// cancelled once one of these has begun
    pub fn is_remote_mutation(&self) -> bool {
        matches!(self, StepKind::CaSubmission | StepKind::Revocation)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::PolicyCheck => "policy_check",
            StepKind::KeyAcquisition => "key_acquisition",
            StepKind::CsrConstruction => "csr_construction",
            StepKind::CaSubmission => "ca_submission",
            StepKind::Revocation => "revocation",
            StepKind::InventoryRecording => "inventory_recording",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-step outputs, persisted with the instance
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResults {
    pub decision: Option<Decision>,
    /// Inventory record targeted by a renewal or revocation
    pub target: Option<CertificateRecord>,
    pub key_reference: Option<KeyReference>,
    /// Key was generated or rotated by this workflow
    pub key_generated: bool,
    pub public_key: Option<Vec<u8>>,
    pub csr: Option<Vec<u8>>,
    pub issued: Option<IssuedCertificate>,
    pub revocation: Option<RevocationAck>,
    pub cert_id: Option<String>,
}

/// Durable state of one request's execution, owned by the orchestrator
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub request_id: Uuid,
    pub request: Request,
    pub state: WorkflowState,
    /// Captured at the policy check and never changed afterwards
    pub policy_version: Option<String>,
    pub results: StepResults,
    /// Attempts spent per step across runs
    pub retry_counts: BTreeMap<StepKind, u32>,
    pub failed_step: Option<StepKind>,
    /// State to return to when a parked workflow resumes
    pub parked_from: Option<WorkflowState>,
    pub resume_token: Option<String>,
    pub resume_count: u32,
    pub error: Option<ErrorResponse>,
    /// Aborted on lock contention; the same request may be submitted again
    pub conflict_aborted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn new(request: Request) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            request_id: request.request_id,
            request,
            state: WorkflowState::Received,
            policy_version: None,
            results: StepResults::default(),
            retry_counts: BTreeMap::new(),
            failed_step: None,
            parked_from: None,
            resume_token: None,
            resume_count: 0,
            error: None,
            conflict_aborted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn operation(&self) -> OperationType {
        self.request.operation()
    }

    /// Step that runs from the current state, if any
    pub fn next_step(&self) -> Option<StepKind> {
        let revoke = self.operation() == OperationType::Revoke;
        match self.state {
            WorkflowState::Received => Some(StepKind::PolicyCheck),
            WorkflowState::PolicyChecked if revoke => Some(StepKind::Revocation),
            WorkflowState::PolicyChecked => Some(StepKind::KeyAcquisition),
            WorkflowState::KeyReady => Some(StepKind::CsrConstruction),
            WorkflowState::CsrReady => Some(StepKind::CaSubmission),
            WorkflowState::CertIssued | WorkflowState::CertRevoked => Some(StepKind::InventoryRecording),
            WorkflowState::StepFailed => self.failed_step,
            _ => None,
        }
    }

    /// Cancellation is allowed until a remote-mutating step has begun
    pub fn is_cancellable(&self) -> bool {
        !self.state.is_terminal() && self.next_step().map_or(false, |step| {
            step == StepKind::PolicyCheck
                || step == StepKind::KeyAcquisition
                || step == StepKind::CsrConstruction
                || (step.is_remote_mutation() && self.state != WorkflowState::StepFailed)
        })
    }

    /// Idempotency key of one step of this workflow
    pub fn step_key(&self, step: &str) -> String {
        format!("{}:{}", self.request.idempotency_key, step)
    }

    /// Inventory id of the certificate this workflow issues
    pub fn issued_cert_id(&self) -> String {
        format!("cert-{}", self.id.simple())
    }
}

/// Summary handed back to callers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub workflow_id: Uuid,
    pub operation: OperationType,
    pub state: WorkflowState,
    pub policy_version: Option<String>,
    pub cert_id: Option<String>,
    pub serial: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub resume_token: Option<String>,
    pub error: Option<ErrorResponse>,
}

impl From<&WorkflowInstance> for WorkflowOutcome {
    fn from(instance: &WorkflowInstance) -> Self {
        let results = &instance.results;
        Self {
            workflow_id: instance.id,
            operation: instance.operation(),
            state: instance.state,
            policy_version: instance.policy_version.clone(),
            cert_id: results.cert_id.clone(),
            serial: results
                .issued
                .as_ref()
                .map(|cert| cert.serial.clone())
                .or_else(|| results.revocation.as_ref().map(|ack| ack.serial.clone())),
            expires_at: results.issued.as_ref().map(|cert| cert.not_after),
            resume_token: instance.resume_token.clone(),
            error: instance.error.clone(),
        }
    }
}
