//! Policy Evaluator
//!
//! Pure decision function over a request and a policy snapshot. Rules run in a
//! fixed order and evaluation stops at the first failing rule.

use chrono::Duration as ChronoDuration;

use crate::collaborators::{KeySpec, KeyUsageProfile};
use crate::workflow::{CertificateProfile, Request, RequestKind};
use super::validators::{validate_dns_name, validate_san, NameViolation};
use super::{Decision, PolicyDocument, RuleId};

type RuleResult = std::result::Result<(), (RuleId, String)>;

/// Stateless evaluator; callers resolve the snapshot and log the outcome
pub struct PolicyEvaluator;

impl PolicyEvaluator {
    /// Evaluate `request` against `policy`.
    ///
    /// Order: algorithm, key size / curve, validity, key usage / EKU,
    /// subject and SAN limits, requester role, renewal window (renew only),
    /// revocation reason (revoke only). Revocations skip the certificate
    /// parameter rules since they carry no profile.
    pub fn evaluate(request: &Request, policy: &PolicyDocument) -> Decision {
        let outcome = match &request.kind {
            RequestKind::Issue { profile } => Self::check_profile(profile, policy)
                .and_then(|_| Self::check_role(request, policy)),
            RequestKind::Renew { profile, current_expires_at, .. } => Self::check_profile(profile, policy)
                .and_then(|_| Self::check_role(request, policy))
                .and_then(|_| {
                    let window = ChronoDuration::days(i64::from(policy.rules.renewal.window_days));
                    if *current_expires_at - request.submitted_at > window {
                        Err((
                            RuleId::RenewalWindow,
                            format!(
                                "Certificate expires {} which is outside the {}-day renewal window",
                                current_expires_at.format("%Y-%m-%d"),
                                policy.rules.renewal.window_days
                            ),
                        ))
                    } else {
                        Ok(())
                    }
                }),
            RequestKind::Revoke { reason, .. } => Self::check_role(request, policy).and_then(|_| {
                if policy.rules.revocation.valid_reasons.iter().any(|r| r == reason) {
                    Ok(())
                } else {
                    Err((
                        RuleId::InvalidRevocationReason,
                        format!(
                            "Invalid revocation reason '{}'. Valid: {}",
                            reason,
                            policy.rules.revocation.valid_reasons.join(", ")
                        ),
                    ))
                }
            }),
        };

        match outcome {
            Ok(()) => Decision::approve(&policy.version),
            Err((rule_id, reason)) => Decision::reject(rule_id, reason, &policy.version),
        }
    }

    fn check_profile(profile: &CertificateProfile, policy: &PolicyDocument) -> RuleResult {
        Self::check_key(&profile.key_spec, policy)?;
        Self::check_validity(profile.validity_days, policy)?;
        Self::check_usage(&profile.key_usage, policy)?;
        Self::check_names(&profile.subject, &profile.sans, policy)
    }

    fn check_key(spec: &KeySpec, policy: &PolicyDocument) -> RuleResult {
        let rule = policy
            .rules
            .algorithms
            .iter()
            .find(|rule| rule.name.eq_ignore_ascii_case(&spec.algorithm))
            .ok_or_else(|| {
                (RuleId::AlgorithmNotAllowed, format!("Algorithm {} is not recognized", spec.algorithm))
            })?;

        if !rule.allowed {
            let reason = rule.reason.as_deref().unwrap_or("not permitted by policy");
            return Err((RuleId::AlgorithmNotAllowed, format!("Algorithm {} not allowed: {}", rule.name, reason)));
        }

        if rule.min_key_size.is_some() || rule.max_key_size.is_some() {
            let size = spec.key_size.ok_or_else(|| {
                (RuleId::KeySizeRequired, format!("{} requests must specify a key size", rule.name))
            })?;

            if let Some(min) = rule.min_key_size {
                if size < min {
                    return Err((RuleId::MinKeySize, format!("{} key size {} below minimum {}", rule.name, size, min)));
                }
            }
            if let Some(max) = rule.max_key_size {
                if size > max {
                    return Err((RuleId::MaxKeySize, format!("{} key size {} exceeds maximum {}", rule.name, size, max)));
                }
            }
        }

        if !rule.allowed_curves.is_empty() {
            let curve = spec.curve.as_deref().ok_or_else(|| {
                (RuleId::CurveRequired, format!("{} requests must specify a curve", rule.name))
            })?;

            if !rule.allowed_curves.iter().any(|c| c.eq_ignore_ascii_case(curve)) {
                return Err((
                    RuleId::CurveNotAllowed,
                    format!("Curve {} not allowed. Allowed: {}", curve, rule.allowed_curves.join(", ")),
                ));
            }
        }

        Ok(())
    }

    fn check_validity(days: u32, policy: &PolicyDocument) -> RuleResult {
        let bounds = &policy.rules.validity;
        if days < bounds.min_days {
            return Err((RuleId::MinValidityDays, format!("Validity {} days below minimum {}", days, bounds.min_days)));
        }
        if days > bounds.max_days {
            return Err((RuleId::MaxValidityDays, format!("Validity {} days exceeds maximum {}", days, bounds.max_days)));
        }
        Ok(())
    }

    fn check_usage(usage: &KeyUsageProfile, policy: &PolicyDocument) -> RuleResult {
        let rule = &policy.rules.key_usage;

        if let Some(unknown) = usage.key_usages.iter().find(|u| !rule.allowed_key_usages.contains(u)) {
            return Err((RuleId::KeyUsageNotAllowed, format!("Key usage {} not allowed", unknown)));
        }
        if let Some(unknown) = usage
            .extended_key_usages
            .iter()
            .find(|u| !rule.allowed_extended_key_usages.contains(u))
        {
            return Err((RuleId::EkuNotAllowed, format!("Extended key usage {} not allowed", unknown)));
        }
        Ok(())
    }

    fn check_names(subject: &str, sans: &[String], policy: &PolicyDocument) -> RuleResult {
        let rule = &policy.rules.san;

        if subject.len() > rule.max_common_name_length {
            return Err((
                RuleId::MaxCommonNameLength,
                format!("Common name length {} exceeds maximum {}", subject.len(), rule.max_common_name_length),
            ));
        }
        validate_dns_name(subject, rule.allow_wildcards).map_err(Self::name_violation)?;

        if rule.required && sans.is_empty() {
            return Err((RuleId::SanRequired, "At least one subject alternative name is required".to_string()));
        }
        if sans.len() > rule.max_count {
            return Err((RuleId::MaxSanCount, format!("{} SANs exceeds maximum {}", sans.len(), rule.max_count)));
        }
        for san in sans {
            validate_san(san, rule.allow_wildcards, rule.allow_ip_addresses).map_err(Self::name_violation)?;
        }

        Ok(())
    }

    fn name_violation(violation: NameViolation) -> (RuleId, String) {
        match violation {
            NameViolation::Syntax(reason) => (RuleId::SanSyntax, reason),
            NameViolation::Wildcard(reason) => (RuleId::WildcardNotAllowed, reason),
        }
    }

    fn check_role(request: &Request, policy: &PolicyDocument) -> RuleResult {
        let operation = request.operation();
        if policy.role_permits(&request.requester_role, operation) {
            Ok(())
        } else {
            Err((
                RuleId::RoleNotPermitted,
                format!("Role '{}' may not {}", request.requester_role, operation),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::collaborators::KeySpec;

    fn profile(key_spec: KeySpec, validity_days: u32) -> CertificateProfile {
        CertificateProfile {
            subject: "api.example.com".to_string(),
            sans: vec!["api.example.com".to_string()],
            key_spec,
            validity_days,
            key_usage: KeyUsageProfile::tls_server(),
        }
    }

    fn rejected_by(request: &Request) -> Option<RuleId> {
        PolicyEvaluator::evaluate(request, &PolicyDocument::baseline()).rule_id
    }

    #[test]
    fn test_rsa_2048_rejected_by_min_key_size() {
        let request = Request::issue(profile(KeySpec::rsa(2048), 90), "admin");
        let decision = PolicyEvaluator::evaluate(&request, &PolicyDocument::baseline());

        assert!(!decision.approved);
        assert_eq!(decision.rule_id, Some(RuleId::MinKeySize));
        assert_eq!(decision.policy_version, "2.3");
        assert!(decision.reason.contains("2048"));
    }

    #[test]
    fn test_compliant_issue_approved() {
        let request = Request::issue(profile(KeySpec::rsa(4096), 90), "operator");
        let decision = PolicyEvaluator::evaluate(&request, &PolicyDocument::baseline());
        assert!(decision.approved, "{}", decision.reason);
        assert!(decision.rule_id.is_none());

        let ecc = Request::issue(profile(KeySpec::ecc("P-384"), 30), "admin");
        assert!(PolicyEvaluator::evaluate(&ecc, &PolicyDocument::baseline()).approved);
    }

    #[test]
    fn test_key_rules() {
        let dsa = KeySpec { algorithm: "DSA".to_string(), key_size: Some(3072), curve: None };
        assert_eq!(rejected_by(&Request::issue(profile(dsa, 90), "admin")), Some(RuleId::AlgorithmNotAllowed));

        let unknown = KeySpec { algorithm: "ROT13".to_string(), key_size: None, curve: None };
        assert_eq!(rejected_by(&Request::issue(profile(unknown, 90), "admin")), Some(RuleId::AlgorithmNotAllowed));

        assert_eq!(rejected_by(&Request::issue(profile(KeySpec::rsa(16384), 90), "admin")), Some(RuleId::MaxKeySize));

        let no_size = KeySpec { algorithm: "RSA".to_string(), key_size: None, curve: None };
        assert_eq!(rejected_by(&Request::issue(profile(no_size, 90), "admin")), Some(RuleId::KeySizeRequired));

        assert_eq!(rejected_by(&Request::issue(profile(KeySpec::ecc("secp256k1"), 90), "admin")), Some(RuleId::CurveNotAllowed));
    }

    #[test]
    fn test_rule_order_short_circuits() {
        // Both key size and validity are out of bounds; key size is checked first
        let request = Request::issue(profile(KeySpec::rsa(1024), 1000), "automation");
        assert_eq!(rejected_by(&request), Some(RuleId::MinKeySize));

        let request = Request::issue(profile(KeySpec::rsa(4096), 1000), "automation");
        assert_eq!(rejected_by(&request), Some(RuleId::MaxValidityDays));

        let request = Request::issue(profile(KeySpec::rsa(4096), 90), "automation");
        assert_eq!(rejected_by(&request), Some(RuleId::RoleNotPermitted));
    }

    #[test]
    fn test_usage_and_name_rules() {
        let mut p = profile(KeySpec::rsa(4096), 90);
        p.key_usage.key_usages.push("cRLSign".to_string());
        assert_eq!(rejected_by(&Request::issue(p, "admin")), Some(RuleId::KeyUsageNotAllowed));

        let mut p = profile(KeySpec::rsa(4096), 90);
        p.key_usage.extended_key_usages.push("timeStamping".to_string());
        assert_eq!(rejected_by(&Request::issue(p, "admin")), Some(RuleId::EkuNotAllowed));

        let mut p = profile(KeySpec::rsa(4096), 90);
        p.sans.clear();
        assert_eq!(rejected_by(&Request::issue(p, "admin")), Some(RuleId::SanRequired));

        let mut p = profile(KeySpec::rsa(4096), 90);
        p.sans = (0..101).map(|i| format!("h{}.example.com", i)).collect();
        assert_eq!(rejected_by(&Request::issue(p, "admin")), Some(RuleId::MaxSanCount));

        let mut p = profile(KeySpec::rsa(4096), 90);
        p.sans.push("www.*.example.com".to_string());
        assert_eq!(rejected_by(&Request::issue(p, "admin")), Some(RuleId::WildcardNotAllowed));

        let mut p = profile(KeySpec::rsa(4096), 90);
        p.sans.push("bad_name.example.com".to_string());
        assert_eq!(rejected_by(&Request::issue(p, "admin")), Some(RuleId::SanSyntax));

        let mut p = profile(KeySpec::rsa(4096), 90);
        p.subject = format!("{}.example.com", "a".repeat(60));
        assert_eq!(rejected_by(&Request::issue(p, "admin")), Some(RuleId::MaxCommonNameLength));
    }

    #[test]
    fn test_revocation_reason() {
        let request = Request::revoke("cert-1", "testing", "admin");
        let decision = PolicyEvaluator::evaluate(&request, &PolicyDocument::baseline());
        assert_eq!(decision.rule_id, Some(RuleId::InvalidRevocationReason));
        assert!(decision.reason.contains("keyCompromise"));

        let request = Request::revoke("cert-1", "keyCompromise", "admin");
        assert!(PolicyEvaluator::evaluate(&request, &PolicyDocument::baseline()).approved);

        let request = Request::revoke("cert-1", "keyCompromise", "operator");
        assert_eq!(rejected_by(&request), Some(RuleId::RoleNotPermitted));
    }

    #[test]
    fn test_renewal_window() {
        let p = profile(KeySpec::rsa(4096), 90);

        let due = Request::renew("cert-1", p.clone(), Utc::now() + ChronoDuration::days(10), false, "automation");
        assert!(PolicyEvaluator::evaluate(&due, &PolicyDocument::baseline()).approved);

        let early = Request::renew("cert-1", p, Utc::now() + ChronoDuration::days(200), false, "automation");
        assert_eq!(rejected_by(&early), Some(RuleId::RenewalWindow));
    }

    #[test]
    fn test_decision_reproducible() {
        let request = Request::issue(profile(KeySpec::rsa(2048), 90), "admin");
        let policy = PolicyDocument::baseline();
        assert_eq!(PolicyEvaluator::evaluate(&request, &policy), PolicyEvaluator::evaluate(&request, &policy));
    }
}
