//! Expiry Scanner
//!
//! Periodically scans the inventory for active certificates inside the renewal
//! threshold and produces renewal requests for them. Each request carries the
//! idempotency key `renew:<cert_id>:<scan day>`, so scans repeated within one
//! day never yield a second renewal workflow for the same certificate.

use std::sync::Arc;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Serialize, Deserialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collaborators::InventoryStore;
use crate::config::ScannerConfig;
use crate::errors::Result;
use crate::inventory::{CertificateRecord, CertificateStatus};
use crate::policy::PolicyStore;
use crate::workflow::Request;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryClass {
    Expired,
    ExpiringSoon,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExpiryItem {
    pub cert_id: String,
    pub subject: String,
    pub serial: String,
    pub expires_at: DateTime<Utc>,
    /// Negative once expired
    pub days_remaining: i64,
    pub class: ExpiryClass,
    /// Idempotency key of the renewal request, when one was produced
    pub renewal_key: Option<String>,
}

/// Side artifact of one scan
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExpiryReport {
    pub scanned_at: DateTime<Utc>,
    pub scan_day: NaiveDate,
    pub threshold_days: u32,
    /// Policy the threshold was taken from; `None` when the configured default was used
    pub policy_version: Option<String>,
    pub items: Vec<ExpiryItem>,
    /// Certificates moved to `expired` by this scan
    pub marked_expired: Vec<String>,
    /// Renewals produced by this scan
    pub enqueued: usize,
    /// Renewals already produced earlier in the same scan day
    pub already_enqueued: usize,
}

impl ExpiryReport {
    pub fn expired(&self) -> impl Iterator<Item = &ExpiryItem> {
        self.items.iter().filter(|item| item.class == ExpiryClass::Expired)
    }

    pub fn expiring_soon(&self) -> impl Iterator<Item = &ExpiryItem> {
        self.items.iter().filter(|item| item.class == ExpiryClass::ExpiringSoon)
    }
}

#[derive(Clone, Debug)]
pub struct ExpiryScan {
    pub report: ExpiryReport,
    pub requests: Vec<Request>,
}

pub struct ExpiryScanner {
    inventory: Arc<dyn InventoryStore>,
    policies: Arc<dyn PolicyStore>,
    config: ScannerConfig,
    /// Renewal keys produced, with the day they belong to
    enqueued: DashMap<String, NaiveDate>,
}

impl ExpiryScanner {
    pub fn new(inventory: Arc<dyn InventoryStore>, policies: Arc<dyn PolicyStore>, config: ScannerConfig) -> Self {
        Self {
            inventory,
            policies,
            config,
            enqueued: DashMap::new(),
        }
    }

    pub fn renewal_key(cert_id: &str, scan_day: NaiveDate) -> String {
        format!("renew:{}:{}", cert_id, scan_day.format("%Y-%m-%d"))
    }

    /// Scan the inventory as of `now`
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<ExpiryScan> {
        let scan_day = now.date_naive();
        let (threshold_days, policy_version) = self.threshold(now).await;

        // Keys from earlier days can no longer collide
        self.enqueued.retain(|_, day| *day >= scan_day);

        let candidates = self.inventory.find_expiring(threshold_days, now).await?;
        debug!("Expiry scan found {} candidates within {} days", candidates.len(), threshold_days);

        let mut report = ExpiryReport {
            scanned_at: now,
            scan_day,
            threshold_days,
            policy_version,
            items: Vec::with_capacity(candidates.len()),
            marked_expired: Vec::new(),
            enqueued: 0,
            already_enqueued: 0,
        };
        let mut requests = Vec::new();

        for record in candidates {
            if record.is_expired(now) {
                if self.config.mark_expired {
                    self.mark_expired(&record, &mut report).await;
                }
                report.items.push(Self::item(&record, now, ExpiryClass::Expired, None));
                continue;
            }

            let key = Self::renewal_key(&record.cert_id, scan_day);
            let fresh = self.enqueued.insert(key.clone(), scan_day).is_none();
            if fresh {
                requests.push(
                    Request::renewal_of(&record, false, &self.config.requester_role).with_idempotency_key(key.clone()),
                );
                report.enqueued += 1;
            } else {
                report.already_enqueued += 1;
            }
            report.items.push(Self::item(&record, now, ExpiryClass::ExpiringSoon, Some(key)));
        }

        info!(
            "Expiry scan {}: {} expiring, {} expired, {} renewals enqueued",
            scan_day,
            report.expiring_soon().count(),
            report.expired().count(),
            report.enqueued
        );
        Ok(ExpiryScan { report, requests })
    }

    /// Scan every `interval` and push renewals onto `queue` until it closes
    pub fn spawn(self: Arc<Self>, queue: mpsc::Sender<Request>) -> JoinHandle<()> {
        let period = self.config.interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let scan = match self.scan(Utc::now()).await {
                    Ok(scan) => scan,
                    Err(e) => {
                        error!("Expiry scan failed: {}", e);
                        continue;
                    }
                };
                for request in scan.requests {
                    if queue.send(request).await.is_err() {
                        info!("Renewal queue closed, stopping expiry scanner");
                        return;
                    }
                }
            }
        })
    }

    async fn threshold(&self, now: DateTime<Utc>) -> (u32, Option<String>) {
        match self.policies.load(now).await {
            Ok(policy) if policy.rules.renewal.threshold_days > 0 => {
                (policy.rules.renewal.threshold_days, Some(policy.version.clone()))
            }
            Ok(_) => (self.config.default_threshold_days, None),
            Err(e) => {
                warn!("No policy for expiry threshold, using {} days: {}", self.config.default_threshold_days, e);
                (self.config.default_threshold_days, None)
            }
        }
    }

    async fn mark_expired(&self, record: &CertificateRecord, report: &mut ExpiryReport) {
        match self
            .inventory
            .update_status(&record.cert_id, CertificateStatus::Expired, "expired")
            .await
        {
            Ok(_) => report.marked_expired.push(record.cert_id.clone()),
            Err(e) => warn!("Could not mark {} expired: {}", record.cert_id, e),
        }
    }

    fn item(record: &CertificateRecord, now: DateTime<Utc>, class: ExpiryClass, renewal_key: Option<String>) -> ExpiryItem {
        ExpiryItem {
            cert_id: record.cert_id.clone(),
            subject: record.subject.clone(),
            serial: record.serial.clone(),
            expires_at: record.expires_at,
            days_remaining: record.days_until_expiry(now),
            class,
            renewal_key,
        }
    }
}

/// Start of the next scan day after `now`
pub fn next_scan_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc() + ChronoDuration::days(1))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Collaborators;
    use crate::inventory::memory::sample_record;
    use crate::inventory::InMemoryInventory;
    use crate::policy::{InMemoryPolicyStore, PolicyDocument};
    use crate::workflow::{InMemoryWorkflowStore, Orchestrator, RequestKind, WorkflowState};
    use crate::audit::{AuditRecorder, InMemoryAuditSink};
    use crate::testing::fast_config;

    async fn seeded() -> (Arc<InMemoryInventory>, ExpiryScanner) {
        let inventory = Arc::new(InMemoryInventory::new());
        for (cert_id, days) in [("soon", 10), ("later", 120), ("gone", -2)] {
            inventory.upsert_certificate(&sample_record(cert_id, days)).await.unwrap();
        }
        let scanner = ExpiryScanner::new(
            inventory.clone(),
            Arc::new(InMemoryPolicyStore::with_baseline()),
            ScannerConfig::default(),
        );
        (inventory, scanner)
    }

    #[tokio::test]
    async fn test_scan_classifies_and_marks_expired() {
        let (inventory, scanner) = seeded().await;
        let now = Utc::now();

        let scan = scanner.scan(now).await.unwrap();
        let report = &scan.report;
        assert_eq!(report.threshold_days, 30);
        assert_eq!(report.policy_version.as_deref(), Some("2.3"));
        assert_eq!(report.items.len(), 2);
        assert_eq!(report.marked_expired, vec!["gone".to_string()]);

        let soon: Vec<&ExpiryItem> = report.expiring_soon().collect();
        assert_eq!(soon.len(), 1);
        assert_eq!(soon[0].cert_id, "soon");
        assert!((9..=10).contains(&soon[0].days_remaining));

        let gone = inventory.get_certificate("gone").await.unwrap().unwrap();
        assert_eq!(gone.status, CertificateStatus::Expired);

        assert_eq!(scan.requests.len(), 1);
        let request = &scan.requests[0];
        assert_eq!(request.requester_role, "automation");
        assert_eq!(request.idempotency_key, ExpiryScanner::renewal_key("soon", now.date_naive()));
        assert!(matches!(&request.kind, RequestKind::Renew { target_cert_id, rotate_key: false, .. } if target_cert_id == "soon"));

        let json = serde_json::to_value(report).unwrap();
        assert_eq!(json["items"][0]["class"], "expired");
        assert_eq!(json["items"][1]["class"], "expiring_soon");
    }

    #[tokio::test]
    async fn test_repeated_scans_in_one_day_enqueue_once() {
        let (_, scanner) = seeded().await;
        let now = Utc::now();

        let first = scanner.scan(now).await.unwrap();
        let second = scanner.scan(now + ChronoDuration::seconds(1)).await.unwrap();
        assert_eq!(first.requests.len(), 1);
        assert!(second.requests.is_empty());
        assert_eq!(second.report.already_enqueued, 1);

        let next_day = scanner.scan(next_scan_day(now) + ChronoDuration::minutes(1)).await.unwrap();
        assert_eq!(next_day.requests.len(), 1);
        assert_ne!(next_day.requests[0].idempotency_key, first.requests[0].idempotency_key);
    }

    #[tokio::test]
    async fn test_threshold_follows_policy_in_effect() {
        let (_, scanner) = seeded().await;
        let mut wider = PolicyDocument::baseline().successor("2.4", Utc::now() - ChronoDuration::seconds(1));
        wider.rules.renewal.threshold_days = 150;
        wider.rules.renewal.window_days = 150;
        scanner.policies.publish(wider).await.unwrap();

        let scan = scanner.scan(Utc::now()).await.unwrap();
        assert_eq!(scan.report.threshold_days, 150);
        assert_eq!(scan.requests.len(), 2);
    }

    #[tokio::test]
    async fn test_scanned_renewal_runs_once_through_orchestrator() {
        let collaborators = Collaborators::in_memory();
        let policies: Arc<dyn PolicyStore> = Arc::new(InMemoryPolicyStore::with_baseline());
        let orchestrator = Orchestrator::new(
            &fast_config(),
            policies.clone(),
            collaborators.clone(),
            Arc::new(AuditRecorder::new(Arc::new(InMemoryAuditSink::new()))),
            Arc::new(InMemoryWorkflowStore::new()),
        );

        let mut record = sample_record("web", 7);
        record.key_reference = collaborators.key_custody.generate(&record.key_spec).await.unwrap();
        collaborators.inventory.upsert_certificate(&record).await.unwrap();

        let scanner = ExpiryScanner::new(collaborators.inventory.clone(), policies, ScannerConfig::default());
        let scan = scanner.scan(Utc::now()).await.unwrap();
        let request = scan.requests.into_iter().next().unwrap();

        let first = orchestrator.submit(request.clone()).await.unwrap();
        let replay = orchestrator.submit(request).await.unwrap();
        assert_eq!(first.state, WorkflowState::Completed);
        assert_eq!(replay.workflow_id, first.workflow_id);
    }

    #[tokio::test]
    async fn test_periodic_loop_feeds_queue() {
        let (_, scanner) = seeded().await;
        let (tx, mut rx) = mpsc::channel(8);

        let handle = Arc::new(scanner).spawn(tx);
        let request = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.target_cert_id(), Some("soon"));

        drop(rx);
        handle.abort();
    }
}
