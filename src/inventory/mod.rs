//! Certificate Inventory
//!
//! Certificate records as held by the inventory collaborator, and the
//! monotonic status rules every inventory implementation enforces.

use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use uuid::Uuid;

use crate::collaborators::{KeyReference, KeySpec, KeyUsageProfile};

pub mod memory;

pub use memory::InMemoryInventory;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    Active,
    Revoked,
    Expired,
}

impl CertificateStatus {
    /// `active -> revoked` and `active -> expired` only; same-status is allowed as a no-op
    pub fn can_transition_to(self, next: CertificateStatus) -> bool {
        self == next || (self == CertificateStatus::Active && next != CertificateStatus::Active)
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CertificateStatus::Active => "active",
            CertificateStatus::Revoked => "revoked",
            CertificateStatus::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// Certificate as recorded in the inventory
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub cert_id: String,
    pub subject: String,
    pub sans: Vec<String>,
    pub serial: String,
    pub key_reference: KeyReference,
    pub key_spec: KeySpec,
    pub key_usage: KeyUsageProfile,
    pub validity_days: u32,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: CertificateStatus,
    /// Policy version the issuing workflow was approved under
    pub policy_version: String,
    pub renewed_from: Option<String>,
    pub superseded_by: Option<String>,
    pub revocation_reason: Option<String>,
    pub status_changed_at: Option<DateTime<Utc>>,
    /// Workflow that produced this record
    pub workflow_id: Uuid,
}

impl CertificateRecord {
    /// Active and not yet replaced by a renewal
    pub fn is_current(&self) -> bool {
        self.status == CertificateStatus::Active && self.superseded_by.is_none()
    }

    /// Whole days until expiry; negative once expired
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_days()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_are_monotonic() {
        use CertificateStatus::*;

        assert!(Active.can_transition_to(Revoked));
        assert!(Active.can_transition_to(Expired));
        assert!(Revoked.can_transition_to(Revoked));
        assert!(!Revoked.can_transition_to(Active));
        assert!(!Expired.can_transition_to(Active));
        assert!(!Expired.can_transition_to(Revoked));
        assert!(!Revoked.can_transition_to(Expired));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&CertificateStatus::Revoked).unwrap(), "\"revoked\"");
        assert_eq!(CertificateStatus::Expired.to_string(), "expired");
    }
}
