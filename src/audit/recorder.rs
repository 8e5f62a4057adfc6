//! Audit Recorder
//!
//! Assigns per-workflow sequence numbers, links each entry to its predecessor
//! and writes it through the sink before the caller may proceed.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

use crate::errors::{Result, StorageError};
use super::{
    AuditEntry, AuditEvent, AuditSink, ComplianceReport, ComplianceStatus, PolicyViolationRecord, GENESIS_HASH,
};

/// Violations listed in full by a compliance report
const RECENT_VIOLATIONS: usize = 10;

#[derive(Debug, Clone)]
struct ChainHead {
    sequence_no: u64,
    hash: String,
}

impl Default for ChainHead {
    fn default() -> Self {
        Self { sequence_no: 0, hash: GENESIS_HASH.to_string() }
    }
}

pub struct AuditRecorder {
    sink: Arc<dyn AuditSink>,
    heads: DashMap<Uuid, Arc<Mutex<ChainHead>>>,
}

impl AuditRecorder {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink, heads: DashMap::new() }
    }

    /// Recorder continuing the chains already present in `sink`
    pub async fn recover(sink: Arc<dyn AuditSink>) -> Result<Self> {
        let recorder = Self::new(sink);

        for entry in recorder.sink.entries().await? {
            let head = recorder.head(entry.workflow_id);
            let mut head = head.lock().await;
            if entry.sequence_no > head.sequence_no {
                head.sequence_no = entry.sequence_no;
                head.hash = entry.entry_hash.clone();
            }
        }

        debug!("Audit recorder recovered {} workflow chains", recorder.heads.len());
        Ok(recorder)
    }

    fn head(&self, workflow_id: Uuid) -> Arc<Mutex<ChainHead>> {
        self.heads.entry(workflow_id).or_default().value().clone()
    }

    /// Sequence, hash and durably append `event`.
    ///
    /// The chain head only advances once the sink has accepted the entry, so a
    /// failed append leaves no gap.
    pub async fn record(&self, event: AuditEvent) -> Result<AuditEntry> {
        let head = self.head(event.workflow_id);
        let mut head = head.lock().await;

        let mut entry = AuditEntry {
            sequence_no: head.sequence_no + 1,
            workflow_id: event.workflow_id,
            cert_id: event.cert_id,
            step: event.step,
            outcome: event.outcome,
            state: event.state,
            attempt: event.attempt,
            policy_version: event.policy_version,
            details: event.details,
            timestamp: Utc::now(),
            prev_hash: head.hash.clone(),
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.compute_hash();

        if let Err(e) = self.sink.append(&entry).await {
            error!("Audit append failed for workflow {}: {}", entry.workflow_id, e);
            return Err(e);
        }

        head.sequence_no = entry.sequence_no;
        head.hash = entry.entry_hash.clone();

        debug!(
            "Audit {}#{}: {} {} -> {}",
            entry.workflow_id, entry.sequence_no, entry.step, entry.outcome, entry.state
        );
        Ok(entry)
    }

    /// Entries of one workflow ordered by sequence number
    pub async fn by_workflow(&self, workflow_id: Uuid) -> Result<Vec<AuditEntry>> {
        let mut entries: Vec<AuditEntry> = self
            .sink
            .entries()
            .await?
            .into_iter()
            .filter(|entry| entry.workflow_id == workflow_id)
            .collect();
        entries.sort_by_key(|entry| entry.sequence_no);
        Ok(entries)
    }

    /// Full trails of every workflow that touched `cert_id`
    pub async fn by_certificate(&self, cert_id: &str) -> Result<Vec<AuditEntry>> {
        let all = self.sink.entries().await?;
        let workflows: HashSet<Uuid> = all
            .iter()
            .filter(|entry| entry.cert_id.as_deref() == Some(cert_id))
            .map(|entry| entry.workflow_id)
            .collect();

        let mut entries: Vec<AuditEntry> = all
            .into_iter()
            .filter(|entry| workflows.contains(&entry.workflow_id))
            .collect();
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.sequence_no.cmp(&b.sequence_no)));
        Ok(entries)
    }

    /// Entries with `from <= timestamp < to`
    pub async fn by_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<AuditEntry>> {
        let mut entries: Vec<AuditEntry> = self
            .sink
            .entries()
            .await?
            .into_iter()
            .filter(|entry| entry.timestamp >= from && entry.timestamp < to)
            .collect();
        entries.sort_by_key(|entry| entry.timestamp);
        Ok(entries)
    }

    /// Check sequence continuity and hash links; returns the number of entries verified
    pub async fn verify_chain(&self, workflow_id: Uuid) -> Result<usize> {
        let entries = self.by_workflow(workflow_id).await?;
        let mut previous = GENESIS_HASH.to_string();

        for (index, entry) in entries.iter().enumerate() {
            let broken = |reason: String| StorageError::AuditChainBroken {
                workflow_id,
                sequence_no: entry.sequence_no,
                reason,
            };

            let expected = index as u64 + 1;
            if entry.sequence_no != expected {
                return Err(broken(format!("expected sequence {}", expected)).into());
            }
            if entry.prev_hash != previous {
                return Err(broken("previous hash mismatch".to_string()).into());
            }
            if entry.compute_hash() != entry.entry_hash {
                return Err(broken("entry hash mismatch".to_string()).into());
            }
            previous = entry.entry_hash.clone();
        }

        Ok(entries.len())
    }

    /// Policy rejections with `from <= timestamp < to`, oldest first
    pub async fn violations(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<PolicyViolationRecord>> {
        Ok(self
            .by_time_range(from, to)
            .await?
            .iter()
            .filter_map(PolicyViolationRecord::from_entry)
            .collect())
    }

    pub async fn compliance_report(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<ComplianceReport> {
        let violations = self.violations(from, to).await?;

        let mut violations_by_rule = BTreeMap::new();
        for violation in &violations {
            *violations_by_rule.entry(violation.rule_id.clone()).or_insert(0) += 1;
        }

        let total_violations = violations.len();
        let status = if total_violations == 0 {
            ComplianceStatus::Compliant
        } else {
            ComplianceStatus::NonCompliant
        };
        let recent_violations = violations[total_violations.saturating_sub(RECENT_VIOLATIONS)..].to_vec();

        debug!("Compliance report {} .. {}: {} violations", from, to, total_violations);
        Ok(ComplianceReport {
            generated_at: Utc::now(),
            from,
            to,
            total_violations,
            violations_by_rule,
            status,
            recent_violations,
        })
    }

    pub fn sink(&self) -> &Arc<dyn AuditSink> {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use crate::audit::{AuditOutcome, FileAuditSink, InMemoryAuditSink};
    use crate::errors::CertFlowError;
    use crate::workflow::{StepKind, WorkflowState};

    fn event(workflow_id: Uuid, step: StepKind, state: WorkflowState) -> AuditEvent {
        AuditEvent::new(workflow_id, step, AuditOutcome::Success, state).policy_version(Some("2.3".to_string()))
    }

    #[tokio::test]
    async fn test_sequences_are_per_workflow() {
        let recorder = AuditRecorder::new(Arc::new(InMemoryAuditSink::new()));
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        recorder.record(event(a, StepKind::PolicyCheck, WorkflowState::PolicyChecked)).await.unwrap();
        recorder.record(event(b, StepKind::PolicyCheck, WorkflowState::PolicyChecked)).await.unwrap();
        let second = recorder.record(event(a, StepKind::KeyAcquisition, WorkflowState::KeyReady)).await.unwrap();

        assert_eq!(second.sequence_no, 2);
        assert_eq!(recorder.by_workflow(a).await.unwrap().len(), 2);
        assert_eq!(recorder.by_workflow(b).await.unwrap().len(), 1);
        assert_eq!(recorder.verify_chain(a).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_verify_chain_detects_tampering() {
        let sink = InMemoryAuditSink::new();
        let recorder = AuditRecorder::new(Arc::new(sink.clone()));
        let id = Uuid::new_v4();

        recorder.record(event(id, StepKind::PolicyCheck, WorkflowState::PolicyChecked)).await.unwrap();
        recorder.record(event(id, StepKind::KeyAcquisition, WorkflowState::KeyReady)).await.unwrap();
        assert!(recorder.verify_chain(id).await.is_ok());

        sink.tamper(0, |entry| entry.outcome = AuditOutcome::FatalError).await;

        match recorder.verify_chain(id).await {
            Err(CertFlowError::Storage(StorageError::AuditChainBroken { sequence_no, .. })) => {
                assert_eq!(sequence_no, 1);
            }
            other => panic!("Expected broken chain, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_queries_by_certificate_and_time() {
        let recorder = AuditRecorder::new(Arc::new(InMemoryAuditSink::new()));
        let id = Uuid::new_v4();
        let start = Utc::now();

        recorder.record(event(id, StepKind::PolicyCheck, WorkflowState::PolicyChecked)).await.unwrap();
        recorder
            .record(event(id, StepKind::InventoryRecording, WorkflowState::InventoryRecorded).cert_id(Some("cert-9".to_string())))
            .await
            .unwrap();
        recorder.record(event(Uuid::new_v4(), StepKind::PolicyCheck, WorkflowState::PolicyChecked)).await.unwrap();

        let trail = recorder.by_certificate("cert-9").await.unwrap();
        assert_eq!(trail.len(), 2);
        assert!(trail.iter().all(|entry| entry.workflow_id == id));

        let window = recorder.by_time_range(start, Utc::now() + ChronoDuration::seconds(1)).await.unwrap();
        assert_eq!(window.len(), 3);
        let empty = recorder.by_time_range(start - ChronoDuration::hours(2), start - ChronoDuration::hours(1)).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_recover_continues_chain() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let id = Uuid::new_v4();

        {
            let recorder = AuditRecorder::new(Arc::new(FileAuditSink::open(&path).await.unwrap()));
            recorder.record(event(id, StepKind::PolicyCheck, WorkflowState::PolicyChecked)).await.unwrap();
            recorder.record(event(id, StepKind::KeyAcquisition, WorkflowState::KeyReady)).await.unwrap();
        }

        let recorder = AuditRecorder::recover(Arc::new(FileAuditSink::open(&path).await.unwrap())).await.unwrap();
        let next = recorder.record(event(id, StepKind::CsrConstruction, WorkflowState::CsrReady)).await.unwrap();

        assert_eq!(next.sequence_no, 3);
        assert_eq!(recorder.verify_chain(id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_compliance_report_totals_rejections_by_rule() {
        let recorder = AuditRecorder::new(Arc::new(InMemoryAuditSink::new()));
        let start = Utc::now();

        let empty = recorder.compliance_report(start, start + ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(empty.status, ComplianceStatus::Compliant);
        assert_eq!(empty.total_violations, 0);

        let rejection = |rule: &str| {
            AuditEvent::new(Uuid::new_v4(), StepKind::PolicyCheck, AuditOutcome::PolicyRejected, WorkflowState::PolicyRejected)
                .policy_version(Some("2.3".to_string()))
                .details(serde_json::json!({ "approved": false, "rule_id": rule, "reason": format!("{} failed", rule) }))
        };
        for rule in ["min_key_size", "role_not_permitted", "min_key_size"] {
            recorder.record(rejection(rule)).await.unwrap();
        }
        recorder.record(event(Uuid::new_v4(), StepKind::PolicyCheck, WorkflowState::PolicyChecked)).await.unwrap();

        let report = recorder.compliance_report(start, Utc::now() + ChronoDuration::seconds(1)).await.unwrap();
        assert_eq!(report.status, ComplianceStatus::NonCompliant);
        assert_eq!(report.total_violations, 3);
        assert_eq!(report.violations_by_rule.get("min_key_size"), Some(&2));
        assert_eq!(report.violations_by_rule.get("role_not_permitted"), Some(&1));
        assert_eq!(report.recent_violations.len(), 3);
        assert_eq!(report.recent_violations[1].reason, "role_not_permitted failed");
        assert_eq!(report.recent_violations[0].policy_version.as_deref(), Some("2.3"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "NON_COMPLIANT");
    }
}
