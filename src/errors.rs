//! certflow Error Types
//!
//! Error taxonomy for the certificate lifecycle core. Collaborators classify their
//! own failures as retryable or fatal; the orchestrator surfaces policy violations,
//! fatal collaborator errors and lock conflicts immediately, and transient errors
//! only once the retry budget is spent.

use std::time::Duration;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use uuid::Uuid;

use crate::collaborators::CollaboratorKind;
use crate::inventory::CertificateStatus;
use crate::workflow::{StepKind, WorkflowState};

/// Main certflow error type
#[derive(Debug, Error)]
pub enum CertFlowError {
    /// Request rejected by the policy evaluator. Terminal, never retried.
    #[error("Policy violation [{rule_id}] under policy v{policy_version}: {message}")]
    PolicyViolation {
        rule_id: String,
        message: String,
        policy_version: String,
    },

    /// Retryable collaborator failure that escaped the retry controller
    #[error("Transient collaborator error: {0}")]
    TransientCollaborator(CollaboratorError),

    /// Non-retryable collaborator failure
    #[error("Fatal collaborator error: {error}")]
    FatalCollaborator {
        error: CollaboratorError,
        policy_version: Option<String>,
        workflow_id: Option<Uuid>,
    },

    /// Another workflow holds the single-writer lock for this subject/key
    #[error("Concurrency conflict on {subject} (key: {}): held by workflow {holder}", .key_reference.as_deref().unwrap_or("<new>"))]
    ConcurrencyConflict {
        subject: String,
        key_reference: Option<String>,
        holder: Uuid,
    },

    /// Retry budget spent; the workflow is parked in STEP_FAILED
    #[error("Retries exhausted for workflow {workflow_id} at {step} after {attempts} attempts: {last_error}")]
    ExhaustedRetries {
        workflow_id: Uuid,
        step: StepKind,
        attempts: u32,
        resume_token: String,
        last_error: String,
        policy_version: Option<String>,
    },

    #[error("Workflow not found: {workflow_id}")]
    WorkflowNotFound { workflow_id: String },

    #[error("Certificate not found: {cert_id}")]
    CertificateNotFound { cert_id: String },

    #[error("Certificate {cert_id} cannot be targeted: {reason}")]
    InvalidTarget {
        cert_id: String,
        reason: String,
        policy_version: Option<String>,
    },

    #[error("Workflow {workflow_id} cannot be cancelled in state {state}")]
    CancellationRejected {
        workflow_id: Uuid,
        state: WorkflowState,
    },

    #[error("Workflow {workflow_id} cannot be resumed from state {state}")]
    NotResumable {
        workflow_id: Uuid,
        state: WorkflowState,
    },

    #[error("Invalid status transition for {cert_id}: {from} -> {to}")]
    InvalidStatusTransition {
        cert_id: String,
        from: CertificateStatus,
        to: CertificateStatus,
    },

    #[error("No policy document in effect at {at}")]
    PolicyUnavailable { at: String },

    #[error("Policy version {version} is already published")]
    DuplicatePolicyVersion { version: String },

    #[error("Invalid policy document: {reason}")]
    InvalidPolicy { reason: String },

    #[error("Batch too large: {size} requests (max: {max})")]
    BatchTooLarge { size: usize, max: usize },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Failure reported by an external collaborator.
///
/// The collaborator decides the class: timeouts and unavailability are retryable,
/// everything else is fatal and bypasses the retry controller.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum CollaboratorError {
    #[error("{collaborator} timed out after {duration:?}")]
    Timeout {
        collaborator: CollaboratorKind,
        duration: Duration,
    },

    #[error("{collaborator} unavailable: {reason}")]
    Unavailable {
        collaborator: CollaboratorKind,
        reason: String,
    },

    #[error("{collaborator} rejected malformed input: {reason}")]
    MalformedInput {
        collaborator: CollaboratorKind,
        reason: String,
    },

    #[error("{collaborator} authentication failed: {reason}")]
    AuthenticationFailed {
        collaborator: CollaboratorKind,
        reason: String,
    },

    #[error("{collaborator} refused the operation: {reason}")]
    Rejected {
        collaborator: CollaboratorKind,
        reason: String,
    },

    #[error("{collaborator} has no record of {identifier}")]
    NotFound {
        collaborator: CollaboratorKind,
        identifier: String,
    },
}

impl CollaboratorError {
    pub fn timeout(collaborator: CollaboratorKind, duration: Duration) -> Self {
        Self::Timeout { collaborator, duration }
    }

    pub fn unavailable(collaborator: CollaboratorKind, reason: impl Into<String>) -> Self {
        Self::Unavailable { collaborator, reason: reason.into() }
    }

    pub fn malformed(collaborator: CollaboratorKind, reason: impl Into<String>) -> Self {
        Self::MalformedInput { collaborator, reason: reason.into() }
    }

    /// Whether the retry controller may try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unavailable { .. })
    }

    pub fn collaborator(&self) -> CollaboratorKind {
        match self {
            Self::Timeout { collaborator, .. }
            | Self::Unavailable { collaborator, .. }
            | Self::MalformedInput { collaborator, .. }
            | Self::AuthenticationFailed { collaborator, .. }
            | Self::Rejected { collaborator, .. }
            | Self::NotFound { collaborator, .. } => *collaborator,
        }
    }
}

/// Configuration specific errors
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Unsupported configuration format: {path}")]
    UnsupportedFormat { path: String },

    #[error("Configuration parse error: {format} - {reason}")]
    ParseError { format: String, reason: String },

    #[error("Configuration validation failed: {field} - {reason}")]
    ValidationFailed { field: String, reason: String },
}

/// Storage specific errors
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum StorageError {
    #[error("Write failed: {operation} - {reason}")]
    WriteFailed { operation: String, reason: String },

    #[error("Read failed: {operation} - {reason}")]
    ReadFailed { operation: String, reason: String },

    #[error("Data corruption detected: {location}")]
    DataCorruption { location: String },

    #[error("Audit chain broken for workflow {workflow_id} at sequence {sequence_no}: {reason}")]
    AuditChainBroken {
        workflow_id: Uuid,
        sequence_no: u64,
        reason: String,
    },
}

/// Result type for certflow operations
pub type Result<T> = std::result::Result<T, CertFlowError>;

/// Structured rejection returned to callers.
///
/// Every rejection carries a reason code, a human message and the policy
/// version consulted (when one was consulted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub rule_id: Option<String>,
    pub policy_version: Option<String>,
    pub workflow_id: Option<Uuid>,
    pub resume_token: Option<String>,
    pub details: Option<serde_json::Value>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ErrorResponse {
    pub fn new(error: &CertFlowError) -> Self {
        Self {
            error: error.to_string(),
            code: Self::error_code(error),
            rule_id: match error {
                CertFlowError::PolicyViolation { rule_id, .. } => Some(rule_id.clone()),
                _ => None,
            },
            policy_version: error.policy_version().map(str::to_string),
            workflow_id: Self::workflow_id(error),
            resume_token: match error {
                CertFlowError::ExhaustedRetries { resume_token, .. } => Some(resume_token.clone()),
                _ => None,
            },
            details: Self::error_details(error),
            timestamp: chrono::Utc::now(),
        }
    }

    fn error_code(error: &CertFlowError) -> String {
        match error {
            CertFlowError::PolicyViolation { .. } => "POLICY_VIOLATION".to_string(),
            CertFlowError::TransientCollaborator(_) => "COLLABORATOR_TRANSIENT".to_string(),
            CertFlowError::FatalCollaborator { error, .. } => match error {
                CollaboratorError::MalformedInput { .. } => "COLLABORATOR_MALFORMED_INPUT".to_string(),
                CollaboratorError::AuthenticationFailed { .. } => "COLLABORATOR_AUTH_FAILED".to_string(),
                _ => "COLLABORATOR_FATAL".to_string(),
            },
            CertFlowError::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT".to_string(),
            CertFlowError::ExhaustedRetries { .. } => "EXHAUSTED_RETRIES".to_string(),
            CertFlowError::WorkflowNotFound { .. } => "WORKFLOW_NOT_FOUND".to_string(),
            CertFlowError::CertificateNotFound { .. } => "CERT_NOT_FOUND".to_string(),
            CertFlowError::InvalidTarget { .. } => "INVALID_TARGET".to_string(),
            CertFlowError::CancellationRejected { .. } => "CANCELLATION_REJECTED".to_string(),
            CertFlowError::NotResumable { .. } => "NOT_RESUMABLE".to_string(),
            CertFlowError::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION".to_string(),
            CertFlowError::PolicyUnavailable { .. } => "POLICY_UNAVAILABLE".to_string(),
            CertFlowError::DuplicatePolicyVersion { .. } | CertFlowError::InvalidPolicy { .. } => {
                "POLICY_DOCUMENT_ERROR".to_string()
            }
            CertFlowError::BatchTooLarge { .. } => "BATCH_TOO_LARGE".to_string(),
            CertFlowError::Configuration(_) => "CONFIG_ERROR".to_string(),
            CertFlowError::Storage(_) => "STORAGE_ERROR".to_string(),
            CertFlowError::Io(_) => "IO_ERROR".to_string(),
            CertFlowError::Serialization(_) => "SERIALIZATION_ERROR".to_string(),
            CertFlowError::Internal { .. } => "INTERNAL_ERROR".to_string(),
        }
    }

    fn workflow_id(error: &CertFlowError) -> Option<Uuid> {
        match error {
            CertFlowError::FatalCollaborator { workflow_id, .. } => *workflow_id,
            CertFlowError::ExhaustedRetries { workflow_id, .. }
            | CertFlowError::CancellationRejected { workflow_id, .. }
            | CertFlowError::NotResumable { workflow_id, .. } => Some(*workflow_id),
            CertFlowError::ConcurrencyConflict { holder, .. } => Some(*holder),
            _ => None,
        }
    }

    fn error_details(error: &CertFlowError) -> Option<serde_json::Value> {
        match error {
            CertFlowError::ExhaustedRetries { step, attempts, last_error, .. } => {
                Some(serde_json::json!({
                    "step": step.to_string(),
                    "attempts": attempts,
                    "last_error": last_error,
                }))
            }
            CertFlowError::ConcurrencyConflict { subject, key_reference, .. } => {
                Some(serde_json::json!({
                    "subject": subject,
                    "key_reference": key_reference,
                }))
            }
            CertFlowError::FatalCollaborator { error, .. } => Some(serde_json::json!({
                "collaborator": error.collaborator().to_string(),
            })),
            _ => None,
        }
    }
}

impl CertFlowError {
    /// Policy version consulted before the failure, if any
    pub fn policy_version(&self) -> Option<&str> {
        match self {
            CertFlowError::PolicyViolation { policy_version, .. } => Some(policy_version),
            CertFlowError::FatalCollaborator { policy_version, .. }
            | CertFlowError::ExhaustedRetries { policy_version, .. }
            | CertFlowError::InvalidTarget { policy_version, .. } => policy_version.as_deref(),
            _ => None,
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CertFlowError::TransientCollaborator(_)
                | CertFlowError::ConcurrencyConflict { .. }
                | CertFlowError::ExhaustedRetries { .. }
        )
    }
}

impl From<CollaboratorError> for CertFlowError {
    fn from(error: CollaboratorError) -> Self {
        if error.is_retryable() {
            CertFlowError::TransientCollaborator(error)
        } else {
            CertFlowError::FatalCollaborator {
                error,
                policy_version: None,
                workflow_id: None,
            }
        }
    }
}

/// Convert anyhow::Error to CertFlowError
impl From<anyhow::Error> for CertFlowError {
    fn from(error: anyhow::Error) -> Self {
        CertFlowError::Internal {
            message: error.to_string(),
        }
    }
}

/// Convert serde_json::Error to CertFlowError
impl From<serde_json::Error> for CertFlowError {
    fn from(error: serde_json::Error) -> Self {
        CertFlowError::Serialization(error.to_string())
    }
}
