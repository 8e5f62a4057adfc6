//! Certificate Policy
//!
//! Versioned, immutable policy documents and the decision type produced by the
//! evaluator. A new policy version is a new document; published documents are
//! never edited in place.

use std::fmt;
use std::sync::Arc;
use anyhow::{anyhow, Result as AnyResult};
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::errors::{CertFlowError, Result};
use crate::workflow::OperationType;

pub mod evaluator;
pub mod store;
pub mod validators;

pub use evaluator::PolicyEvaluator;
pub use store::{InMemoryPolicyStore, PolicyStore};

/// Shared handle to an immutable policy document
pub type PolicySnapshot = Arc<PolicyDocument>;

/// Published policy document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub version: String,
    pub effective_date: DateTime<Utc>,
    pub rules: PolicyRules,
}

/// Rule set, evaluated in a fixed order by [`PolicyEvaluator`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyRules {
    pub algorithms: Vec<AlgorithmRule>,
    pub validity: ValidityRule,
    pub key_usage: KeyUsageRule,
    pub san: SanRule,
    pub roles: Vec<RolePermission>,
    pub revocation: RevocationRule,
    pub renewal: RenewalRule,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmRule {
    pub name: String,
    pub allowed: bool,
    pub min_key_size: Option<u32>,
    pub max_key_size: Option<u32>,
    #[serde(default)]
    pub allowed_curves: Vec<String>,
    /// Explanation reported when the algorithm is disallowed
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidityRule {
    pub min_days: u32,
    pub max_days: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyUsageRule {
    pub allowed_key_usages: Vec<String>,
    pub allowed_extended_key_usages: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SanRule {
    pub required: bool,
    pub max_count: usize,
    pub allow_wildcards: bool,
    pub allow_ip_addresses: bool,
    pub max_common_name_length: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RolePermission {
    pub role: String,
    pub operations: Vec<OperationType>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RevocationRule {
    pub valid_reasons: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RenewalRule {
    /// Expiry scanner picks up certificates expiring within this many days
    pub threshold_days: u32,
    /// A renewal is only approved this close to the current certificate's expiry
    pub window_days: u32,
}

/// Stable machine-readable identifiers for rejections
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    AlgorithmNotAllowed,
    KeySizeRequired,
    MinKeySize,
    MaxKeySize,
    CurveRequired,
    CurveNotAllowed,
    MinValidityDays,
    MaxValidityDays,
    KeyUsageNotAllowed,
    EkuNotAllowed,
    SubjectSyntax,
    MaxCommonNameLength,
    SanRequired,
    MaxSanCount,
    SanSyntax,
    WildcardNotAllowed,
    RoleNotPermitted,
    RenewalWindow,
    InvalidRevocationReason,
}

impl RuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::AlgorithmNotAllowed => "algorithm_not_allowed",
            RuleId::KeySizeRequired => "key_size_required",
            RuleId::MinKeySize => "min_key_size",
            RuleId::MaxKeySize => "max_key_size",
            RuleId::CurveRequired => "curve_required",
            RuleId::CurveNotAllowed => "curve_not_allowed",
            RuleId::MinValidityDays => "min_validity_days",
            RuleId::MaxValidityDays => "max_validity_days",
            RuleId::KeyUsageNotAllowed => "key_usage_not_allowed",
            RuleId::EkuNotAllowed => "eku_not_allowed",
            RuleId::SubjectSyntax => "subject_syntax",
            RuleId::MaxCommonNameLength => "max_common_name_length",
            RuleId::SanRequired => "san_required",
            RuleId::MaxSanCount => "max_san_count",
            RuleId::SanSyntax => "san_syntax",
            RuleId::WildcardNotAllowed => "wildcard_not_allowed",
            RuleId::RoleNotPermitted => "role_not_permitted",
            RuleId::RenewalWindow => "renewal_window",
            RuleId::InvalidRevocationReason => "invalid_revocation_reason",
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a policy evaluation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub approved: bool,
    pub rule_id: Option<RuleId>,
    pub reason: String,
    pub policy_version: String,
}

impl Decision {
    pub fn approve(policy_version: &str) -> Self {
        Self {
            approved: true,
            rule_id: None,
            reason: format!("Approved under policy v{}", policy_version),
            policy_version: policy_version.to_string(),
        }
    }

    pub fn reject(rule_id: RuleId, reason: impl Into<String>, policy_version: &str) -> Self {
        Self {
            approved: false,
            rule_id: Some(rule_id),
            reason: reason.into(),
            policy_version: policy_version.to_string(),
        }
    }

    /// Convert a rejection into [`CertFlowError::PolicyViolation`]
    pub fn into_result(self) -> Result<Decision> {
        if self.approved {
            return Ok(self);
        }
        Err(CertFlowError::PolicyViolation {
            rule_id: self
                .rule_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "unspecified".to_string()),
            message: self.reason,
            policy_version: self.policy_version,
        })
    }
}

impl PolicyDocument {
    /// Reference policy v2.3
    pub fn baseline() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        Self {
            version: "2.3".to_string(),
            effective_date: DateTime::<Utc>::default(),
            rules: PolicyRules {
                algorithms: vec![
                    AlgorithmRule {
                        name: "RSA".to_string(),
                        allowed: true,
                        min_key_size: Some(3072),
                        max_key_size: Some(8192),
                        allowed_curves: Vec::new(),
                        reason: None,
                    },
                    AlgorithmRule {
                        name: "ECC".to_string(),
                        allowed: true,
                        min_key_size: None,
                        max_key_size: None,
                        allowed_curves: strings(&["P-256", "P-384", "P-521"]),
                        reason: None,
                    },
                    AlgorithmRule {
                        name: "DSA".to_string(),
                        allowed: false,
                        min_key_size: None,
                        max_key_size: None,
                        allowed_curves: Vec::new(),
                        reason: Some("Deprecated - use RSA or ECC".to_string()),
                    },
                ],
                validity: ValidityRule { min_days: 1, max_days: 397 },
                key_usage: KeyUsageRule {
                    allowed_key_usages: strings(&[
                        "digitalSignature",
                        "keyEncipherment",
                        "dataEncipherment",
                        "keyAgreement",
                    ]),
                    allowed_extended_key_usages: strings(&[
                        "serverAuth",
                        "clientAuth",
                        "codeSigning",
                        "emailProtection",
                    ]),
                },
                san: SanRule {
                    required: true,
                    max_count: 100,
                    allow_wildcards: true,
                    allow_ip_addresses: false,
                    max_common_name_length: 64,
                },
                roles: vec![
                    RolePermission {
                        role: "admin".to_string(),
                        operations: vec![OperationType::Issue, OperationType::Renew, OperationType::Revoke],
                    },
                    RolePermission {
                        role: "operator".to_string(),
                        operations: vec![OperationType::Issue, OperationType::Renew],
                    },
                    RolePermission {
                        role: "automation".to_string(),
                        operations: vec![OperationType::Renew],
                    },
                ],
                revocation: RevocationRule {
                    valid_reasons: strings(&[
                        "unspecified",
                        "keyCompromise",
                        "caCompromise",
                        "affiliationChanged",
                        "superseded",
                        "cessationOfOperation",
                        "certificateHold",
                        "privilegeWithdrawn",
                    ]),
                },
                renewal: RenewalRule { threshold_days: 30, window_days: 30 },
            },
        }
    }

    /// Copy of this document under a new version and effective date
    pub fn successor(&self, version: &str, effective_date: DateTime<Utc>) -> Self {
        Self {
            version: version.to_string(),
            effective_date,
            rules: self.rules.clone(),
        }
    }

    /// One rule category (`algorithms`, `validity`, `key_usage`, `san`, `roles`,
    /// `revocation`, `renewal`) as JSON, or the whole rule set for `all`
    pub fn section(&self, category: &str) -> Option<serde_json::Value> {
        let rules = serde_json::to_value(&self.rules).ok()?;
        if category == "all" {
            return Some(rules);
        }
        rules.get(category).cloned()
    }

    /// Internal consistency checks run before publication
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(CertFlowError::InvalidPolicy { reason });
        let rules = &self.rules;

        if self.version.trim().is_empty() {
            return invalid("version must not be empty".to_string());
        }
        if rules.algorithms.is_empty() {
            return invalid("at least one algorithm rule is required".to_string());
        }
        for algorithm in &rules.algorithms {
            if let (Some(min), Some(max)) = (algorithm.min_key_size, algorithm.max_key_size) {
                if min > max {
                    return invalid(format!("{} key size bounds inverted: {} > {}", algorithm.name, min, max));
                }
            }
        }
        if rules.validity.min_days == 0 || rules.validity.min_days > rules.validity.max_days {
            return invalid(format!(
                "validity bounds invalid: {}..={}",
                rules.validity.min_days, rules.validity.max_days
            ));
        }
        if rules.san.max_count == 0 {
            return invalid("SAN max_count must be at least 1".to_string());
        }
        if rules.roles.is_empty() {
            return invalid("at least one role permission is required".to_string());
        }
        if rules.renewal.threshold_days == 0 || rules.renewal.window_days == 0 {
            return invalid("renewal threshold and window must be positive".to_string());
        }

        Ok(())
    }

    /// Load a policy document from a JSON, TOML or YAML file
    pub fn from_file(path: &str) -> AnyResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read policy file {}: {}", path, e))?;

        if path.ends_with(".toml") {
            toml::from_str(&contents).map_err(|e| anyhow!("Failed to parse TOML policy: {}", e))
        } else if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::from_str(&contents).map_err(|e| anyhow!("Failed to parse YAML policy: {}", e))
        } else if path.ends_with(".json") {
            serde_json::from_str(&contents).map_err(|e| anyhow!("Failed to parse JSON policy: {}", e))
        } else {
            Err(anyhow!("Unsupported policy file format: {}", path))
        }
    }

    pub fn role_permits(&self, role: &str, operation: OperationType) -> bool {
        self.rules
            .roles
            .iter()
            .any(|permission| permission.role == role && permission.operations.contains(&operation))
    }
}
