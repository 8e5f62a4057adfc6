//! Audit Trail
//!
//! Append-only, per-workflow ordered record of every workflow transition and
//! every failed collaborator attempt. Entries are hash-chained per workflow so
//! that edits, reordering and gaps can be detected after the fact.

use std::collections::BTreeMap;
use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};
use uuid::Uuid;

use crate::workflow::{StepKind, WorkflowState};

pub mod recorder;
pub mod sink;

pub use recorder::AuditRecorder;
pub use sink::{AuditSink, FileAuditSink, InMemoryAuditSink};

/// `prev_hash` of the first entry in every workflow chain
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    PolicyRejected,
    TransientError,
    FatalError,
    /// Retry budget spent, workflow parked
    Parked,
    Resumed,
    Cancelled,
    Aborted,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditOutcome::Success => "success",
            AuditOutcome::PolicyRejected => "policy_rejected",
            AuditOutcome::TransientError => "transient_error",
            AuditOutcome::FatalError => "fatal_error",
            AuditOutcome::Parked => "parked",
            AuditOutcome::Resumed => "resumed",
            AuditOutcome::Cancelled => "cancelled",
            AuditOutcome::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Immutable audit record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position within the workflow's chain, starting at 1
    pub sequence_no: u64,
    pub workflow_id: Uuid,
    pub cert_id: Option<String>,
    pub step: StepKind,
    pub outcome: AuditOutcome,
    /// Workflow state once this entry is written
    pub state: WorkflowState,
    /// Collaborator attempt number; 0 when no collaborator was called
    pub attempt: u32,
    pub policy_version: Option<String>,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub entry_hash: String,
}

/// Hashed view of an entry: every field except `entry_hash`
#[derive(Serialize)]
struct HashedFields<'a> {
    sequence_no: u64,
    workflow_id: &'a Uuid,
    cert_id: &'a Option<String>,
    step: &'a StepKind,
    outcome: &'a AuditOutcome,
    state: &'a WorkflowState,
    attempt: u32,
    policy_version: &'a Option<String>,
    details: &'a serde_json::Value,
    timestamp: &'a DateTime<Utc>,
    prev_hash: &'a str,
}

impl AuditEntry {
    /// SHA-256 over the canonical JSON of the entry, excluding `entry_hash`
    pub fn compute_hash(&self) -> String {
        let fields = HashedFields {
            sequence_no: self.sequence_no,
            workflow_id: &self.workflow_id,
            cert_id: &self.cert_id,
            step: &self.step,
            outcome: &self.outcome,
            state: &self.state,
            attempt: self.attempt,
            policy_version: &self.policy_version,
            details: &self.details,
            timestamp: &self.timestamp,
            prev_hash: &self.prev_hash,
        };

        // Serializing plain data into a Vec cannot fail
        let canonical = serde_json::to_vec(&fields).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }
}

/// Content of an entry before sequencing and hashing
#[derive(Clone, Debug)]
pub struct AuditEvent {
    pub workflow_id: Uuid,
    pub cert_id: Option<String>,
    pub step: StepKind,
    pub outcome: AuditOutcome,
    pub state: WorkflowState,
    pub attempt: u32,
    pub policy_version: Option<String>,
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn new(workflow_id: Uuid, step: StepKind, outcome: AuditOutcome, state: WorkflowState) -> Self {
        Self {
            workflow_id,
            cert_id: None,
            step,
            outcome,
            state,
            attempt: 0,
            policy_version: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn cert_id(mut self, cert_id: Option<String>) -> Self {
        self.cert_id = cert_id;
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn policy_version(mut self, version: Option<String>) -> Self {
        self.policy_version = version;
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// One policy rejection, as read back from the trail
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyViolationRecord {
    pub workflow_id: Uuid,
    pub cert_id: Option<String>,
    pub rule_id: String,
    pub reason: String,
    pub policy_version: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl PolicyViolationRecord {
    /// `None` unless `entry` records a policy rejection
    pub fn from_entry(entry: &AuditEntry) -> Option<Self> {
        if entry.outcome != AuditOutcome::PolicyRejected {
            return None;
        }
        let text = |field: &str| entry.details.get(field).and_then(|value| value.as_str()).unwrap_or_default().to_string();

        Some(Self {
            workflow_id: entry.workflow_id,
            cert_id: entry.cert_id.clone(),
            rule_id: text("rule_id"),
            reason: text("reason"),
            policy_version: entry.policy_version.clone(),
            timestamp: entry.timestamp,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceStatus {
    Compliant,
    NonCompliant,
}

/// Policy rejections over a time window, totalled per rule
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub generated_at: DateTime<Utc>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub total_violations: usize,
    pub violations_by_rule: BTreeMap<String, usize>,
    pub status: ComplianceStatus,
    /// Newest last
    pub recent_violations: Vec<PolicyViolationRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> AuditEntry {
        let mut entry = AuditEntry {
            sequence_no: 1,
            workflow_id: Uuid::new_v4(),
            cert_id: None,
            step: StepKind::PolicyCheck,
            outcome: AuditOutcome::Success,
            state: WorkflowState::PolicyChecked,
            attempt: 0,
            policy_version: Some("2.3".to_string()),
            details: serde_json::json!({"b": 2, "a": 1}),
            timestamp: Utc::now(),
            prev_hash: GENESIS_HASH.to_string(),
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.compute_hash();
        entry
    }

    #[test]
    fn test_hash_covers_content() {
        let original = entry();
        assert_eq!(original.entry_hash.len(), 64);
        assert_eq!(original.compute_hash(), original.entry_hash);

        let mut tampered = original.clone();
        tampered.outcome = AuditOutcome::FatalError;
        assert_ne!(tampered.compute_hash(), original.entry_hash);

        let mut relinked = original.clone();
        relinked.prev_hash = "f".repeat(64);
        assert_ne!(relinked.compute_hash(), original.entry_hash);
    }

    #[test]
    fn test_hash_survives_serialization() {
        let original = entry();
        let json = serde_json::to_string(&original).unwrap();
        let restored: AuditEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.compute_hash(), original.entry_hash);
    }

    #[test]
    fn test_outcome_names() {
        assert_eq!(AuditOutcome::TransientError.to_string(), "transient_error");
        assert_eq!(serde_json::to_string(&AuditOutcome::PolicyRejected).unwrap(), "\"policy_rejected\"");
    }
}
