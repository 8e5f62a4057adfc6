//! Retry and Idempotency Controller
//!
//! Wraps collaborator calls with a bounded timeout, exponential backoff with a
//! cap and jitter, and an idempotency-key index. Before every attempt the
//! controller checks the index and the collaborator's own system of record, so
//! a non-idempotent remote operation runs at most once per key.
//!
//! With a [`CollaboratorGate`] attached, each attempt waits for a call slot
//! before its timeout starts, so queueing never counts against the collaborator.

use std::future::Future;
use std::time::Duration;
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use crate::batch::CollaboratorGate;
use crate::collaborators::CollaboratorKind;
use crate::config::RetryConfig;
use crate::errors::{CertFlowError, CollaboratorError};
use crate::workflow::StepKind;

/// Backoff and timeout parameters for one step
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub cap_delay: Duration,
    /// Fraction of the delay added or removed at random, in `[0, 1]`
    pub jitter: f64,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    /// `min(base * 2^attempt, cap)` for a zero-based retry number
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.checked_mul(factor).unwrap_or(self.cap_delay).min(self.cap_delay)
    }

    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64((1.0 + spread).max(0.0)).min(self.cap_delay)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            cap_delay: config.cap_delay,
            jitter: config.jitter,
            call_timeout: config.call_timeout,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Last known successful outcome per idempotency key
#[derive(Default)]
pub struct IdempotencyIndex {
    outcomes: DashMap<String, serde_json::Value>,
}

impl IdempotencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.outcomes
            .get(key)
            .and_then(|value| serde_json::from_value(value.value().clone()).ok())
    }

    pub fn put<T: Serialize>(&self, key: &str, outcome: &T) {
        match serde_json::to_value(outcome) {
            Ok(value) => {
                self.outcomes.insert(key.to_string(), value);
            }
            Err(e) => warn!("Could not index outcome for {}: {}", key, e),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.outcomes.contains_key(key)
    }

    /// Drop every outcome whose key starts with `prefix`
    pub fn forget_prefix(&self, prefix: &str) -> usize {
        let before = self.outcomes.len();
        self.outcomes.retain(|key, _| !key.starts_with(prefix));
        before.saturating_sub(self.outcomes.len())
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Notified of every failed attempt before the controller sleeps or gives up.
/// An error from the observer stops the step.
#[async_trait]
pub trait RetryObserver: Send + Sync {
    async fn attempt_failed(
        &self,
        step: StepKind,
        attempt: u32,
        error: &CollaboratorError,
    ) -> Result<(), CertFlowError>;
}

/// Observer that ignores failures
pub struct NoopObserver;

#[async_trait]
impl RetryObserver for NoopObserver {
    async fn attempt_failed(&self, _: StepKind, _: u32, _: &CollaboratorError) -> Result<(), CertFlowError> {
        Ok(())
    }
}

/// Successful step result
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome<T> {
    pub value: T,
    /// Attempt that produced the value; 0 when an earlier outcome was reused
    pub attempts: u32,
    pub reused: bool,
}

/// Why a step gave up
#[derive(Debug)]
pub enum StepFailure {
    Fatal { error: CollaboratorError, attempts: u32 },
    Exhausted { last_error: CollaboratorError, attempts: u32 },
    /// The observer could not record a failed attempt
    Observer(CertFlowError),
}

pub struct RetryController {
    policy: RetryPolicy,
    index: IdempotencyIndex,
    gate: Option<CollaboratorGate>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, index: IdempotencyIndex::new(), gate: None }
    }

    /// Bound in-flight calls per collaborator through `gate`
    pub fn with_gate(mut self, gate: CollaboratorGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn index(&self) -> &IdempotencyIndex {
        &self.index
    }

    /// Run `op` with retries and no remote lookup
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        step: StepKind,
        collaborator: CollaboratorKind,
        observer: &dyn RetryObserver,
        op: F,
    ) -> Result<StepOutcome<T>, StepFailure>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, CollaboratorError>> + Send,
    {
        self.execute_with_probe(key, step, collaborator, observer, || std::future::ready(Ok(None)), op)
            .await
    }

    /// Run `op` with retries. Before each attempt the index and then `probe` are
    /// consulted for an outcome already produced under `key`.
    pub async fn execute_with_probe<T, F, Fut, P, PFut>(
        &self,
        key: &str,
        step: StepKind,
        collaborator: CollaboratorKind,
        observer: &dyn RetryObserver,
        probe: P,
        op: F,
    ) -> Result<StepOutcome<T>, StepFailure>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, CollaboratorError>> + Send,
        P: FnMut() -> PFut + Send,
        PFut: Future<Output = Result<Option<T>, CollaboratorError>> + Send,
    {
        self.run(key, step, collaborator, observer, true, probe, op).await
    }

    /// Run a read with retries, bypassing the index in both directions so the
    /// caller always sees the collaborator's current answer
    pub async fn execute_read<T, F, Fut>(
        &self,
        key: &str,
        step: StepKind,
        collaborator: CollaboratorKind,
        observer: &dyn RetryObserver,
        op: F,
    ) -> Result<StepOutcome<T>, StepFailure>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, CollaboratorError>> + Send,
    {
        self.run(key, step, collaborator, observer, false, || std::future::ready(Ok(None)), op)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run<T, F, Fut, P, PFut>(
        &self,
        key: &str,
        step: StepKind,
        collaborator: CollaboratorKind,
        observer: &dyn RetryObserver,
        indexed: bool,
        mut probe: P,
        mut op: F,
    ) -> Result<StepOutcome<T>, StepFailure>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, CollaboratorError>> + Send,
        P: FnMut() -> PFut + Send,
        PFut: Future<Output = Result<Option<T>, CollaboratorError>> + Send,
    {
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if indexed {
                if let Some(value) = self.index.get::<T>(key) {
                    debug!("{} reused indexed outcome for {}", step, key);
                    return Ok(StepOutcome { value, attempts: 0, reused: true });
                }
            }

            // Held for this attempt's lookup and call, released before any backoff
            let slot = match &self.gate {
                Some(gate) => gate.acquire(collaborator).await,
                None => None,
            };

            match tokio::time::timeout(self.policy.call_timeout, probe()).await {
                Ok(Ok(Some(value))) => {
                    info!("{} found existing result for {} at {}", step, key, collaborator);
                    if indexed {
                        self.index.put(key, &value);
                    }
                    return Ok(StepOutcome { value, attempts: 0, reused: true });
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!("{} lookup for {} failed, calling anyway: {}", step, key, e),
                Err(_) => warn!("{} lookup for {} timed out, calling anyway", step, key),
            }

            let error = match tokio::time::timeout(self.policy.call_timeout, op()).await {
                Ok(Ok(value)) => {
                    if indexed {
                        self.index.put(key, &value);
                    }
                    if attempt > 1 {
                        info!("{} succeeded for {} on attempt {}", step, key, attempt);
                    }
                    return Ok(StepOutcome { value, attempts: attempt, reused: false });
                }
                Ok(Err(e)) => e,
                Err(_) => CollaboratorError::timeout(collaborator, self.policy.call_timeout),
            };

            drop(slot);

            observer
                .attempt_failed(step, attempt, &error)
                .await
                .map_err(StepFailure::Observer)?;

            if !error.is_retryable() {
                warn!("{} failed fatally for {}: {}", step, key, error);
                return Err(StepFailure::Fatal { error, attempts: attempt });
            }

            if attempt == max_attempts {
                warn!("{} exhausted {} attempts for {}: {}", step, attempt, key, error);
                return Err(StepFailure::Exhausted { last_error: error, attempts: attempt });
            }

            let delay = self.policy.jittered_backoff(attempt - 1);
            warn!("{} attempt {} failed for {}: {}; retrying in {:?}", step, attempt, key, error, delay);
            tokio::time::sleep(delay).await;
        }

        // max_attempts >= 1, so the loop always returns
        Err(StepFailure::Exhausted {
            last_error: CollaboratorError::unavailable(collaborator, "no attempts made"),
            attempts: 0,
        })
    }
}
