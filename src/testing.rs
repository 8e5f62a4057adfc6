//! Collaborator doubles for exercising failure paths

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;

use crate::audit::{AuditEntry, AuditSink, InMemoryAuditSink};
use crate::collaborators::{
    CertificateAuthority, CollaboratorKind, CsrBuilder, InMemoryCertificateAuthority, InMemoryKeyCustody,
    IssuedCertificate, KeyCustody, KeyReference, KeySpec, KeyUsageProfile, RevocationAck, TemplateCsrBuilder,
};
use crate::config::CertFlowConfig;
use crate::errors::{CollaboratorError, Result, StorageError};

/// Millisecond backoff so retry paths run quickly
pub(crate) fn fast_config() -> CertFlowConfig {
    let mut config = CertFlowConfig::localhost_testing();
    config.retry.max_attempts = 4;
    config.retry.base_delay = Duration::from_millis(1);
    config.retry.cap_delay = Duration::from_millis(5);
    config.retry.jitter = 0.0;
    config.retry.call_timeout = Duration::from_millis(500);
    config.retry.max_resume_attempts = 2;
    config
}

/// CA that times out a set number of times before delegating.
///
/// In lost-response mode the failing calls reach the inner CA and issue a
/// certificate before reporting the timeout.
pub(crate) struct FlakyAuthority {
    pub inner: InMemoryCertificateAuthority,
    failures_left: AtomicU32,
    lose_responses: bool,
    issue_calls: AtomicU32,
}

impl FlakyAuthority {
    pub fn failing(times: u32) -> Self {
        Self {
            inner: InMemoryCertificateAuthority::new(),
            failures_left: AtomicU32::new(times),
            lose_responses: false,
            issue_calls: AtomicU32::new(0),
        }
    }

    pub fn losing_responses(times: u32) -> Self {
        Self { lose_responses: true, ..Self::failing(times) }
    }

    pub fn issue_calls(&self) -> u32 {
        self.issue_calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CertificateAuthority for FlakyAuthority {
    async fn issue(
        &self,
        csr: &[u8],
        validity_days: u32,
        idempotency_key: &str,
    ) -> std::result::Result<IssuedCertificate, CollaboratorError> {
        self.issue_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            if self.lose_responses {
                self.inner.issue(csr, validity_days, idempotency_key).await?;
            }
            return Err(CollaboratorError::timeout(CollaboratorKind::CertificateAuthority, Duration::from_secs(30)));
        }
        self.inner.issue(csr, validity_days, idempotency_key).await
    }

    async fn find_issued(&self, idempotency_key: &str) -> std::result::Result<Option<IssuedCertificate>, CollaboratorError> {
        self.inner.find_issued(idempotency_key).await
    }

    async fn revoke(&self, serial: &str, reason: &str) -> std::result::Result<RevocationAck, CollaboratorError> {
        self.inner.revoke(serial, reason).await
    }
}

/// CA that holds every call for `delay` and records peak concurrency
pub(crate) struct SlowAuthority {
    pub inner: InMemoryCertificateAuthority,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    revoke_calls: AtomicU32,
}

impl SlowAuthority {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryCertificateAuthority::new(),
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            revoke_calls: AtomicU32::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn revoke_calls(&self) -> u32 {
        self.revoke_calls.load(Ordering::SeqCst)
    }

    async fn hold(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        // Decrements even when a timeout drops this call mid-sleep
        let _in_flight = InFlight(&self.in_flight);
        tokio::time::sleep(self.delay).await;
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CertificateAuthority for SlowAuthority {
    async fn issue(
        &self,
        csr: &[u8],
        validity_days: u32,
        idempotency_key: &str,
    ) -> std::result::Result<IssuedCertificate, CollaboratorError> {
        self.hold().await;
        self.inner.issue(csr, validity_days, idempotency_key).await
    }

    async fn find_issued(&self, idempotency_key: &str) -> std::result::Result<Option<IssuedCertificate>, CollaboratorError> {
        self.inner.find_issued(idempotency_key).await
    }

    async fn revoke(&self, serial: &str, reason: &str) -> std::result::Result<RevocationAck, CollaboratorError> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        self.hold().await;
        self.inner.revoke(serial, reason).await
    }
}

/// Custody that counts calls and can be told to reject credentials
#[derive(Default)]
pub(crate) struct CountingKeyCustody {
    pub inner: InMemoryKeyCustody,
    calls: AtomicU32,
    reject: AtomicBool,
}

impl CountingKeyCustody {
    pub fn rejecting() -> Self {
        let custody = Self::default();
        custody.reject.store(true, Ordering::SeqCst);
        custody
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> std::result::Result<(), CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(CollaboratorError::AuthenticationFailed {
                collaborator: CollaboratorKind::KeyCustody,
                reason: "expired credentials".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl KeyCustody for CountingKeyCustody {
    async fn generate(&self, spec: &KeySpec) -> std::result::Result<KeyReference, CollaboratorError> {
        self.enter()?;
        self.inner.generate(spec).await
    }

    async fn get_public_key(&self, key: &KeyReference) -> std::result::Result<Vec<u8>, CollaboratorError> {
        self.enter()?;
        self.inner.get_public_key(key).await
    }

    async fn rotate(&self, key: &KeyReference) -> std::result::Result<KeyReference, CollaboratorError> {
        self.enter()?;
        self.inner.rotate(key).await
    }

    async fn destroy(&self, key: &KeyReference) -> std::result::Result<(), CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.destroy(key).await
    }
}

/// CSR builder that reports itself unavailable until switched back on
#[derive(Default)]
pub(crate) struct OutageCsrBuilder {
    down: AtomicBool,
    calls: AtomicU32,
}

impl OutageCsrBuilder {
    pub fn down() -> Self {
        let builder = Self::default();
        builder.down.store(true, Ordering::SeqCst);
        builder
    }

    pub fn restore(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CsrBuilder for OutageCsrBuilder {
    async fn build(
        &self,
        subject: &str,
        sans: &[String],
        public_key: &[u8],
        profile: &KeyUsageProfile,
    ) -> std::result::Result<Vec<u8>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(CollaboratorError::unavailable(CollaboratorKind::CsrBuilder, "503 Service Unavailable"));
        }
        TemplateCsrBuilder.build(subject, sans, public_key, profile).await
    }
}

/// Sink that accepts a fixed number of entries and then fails every append
pub(crate) struct FailingAuditSink {
    pub inner: InMemoryAuditSink,
    accept: usize,
    accepted: AtomicUsize,
}

impl FailingAuditSink {
    pub fn after(accept: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryAuditSink::new(),
            accept,
            accepted: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl AuditSink for FailingAuditSink {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        if self.accepted.fetch_add(1, Ordering::SeqCst) >= self.accept {
            return Err(StorageError::WriteFailed {
                operation: "append audit entry".to_string(),
                reason: "disk full".to_string(),
            }
            .into());
        }
        self.inner.append(entry).await
    }

    async fn entries(&self) -> Result<Vec<AuditEntry>> {
        self.inner.entries().await
    }
}
