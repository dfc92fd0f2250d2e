//! Built-in isolation rules

use ccn_common::{TenantAccount, TenantRegistry};
use ccn_credentials::model::arn_account;
use ccn_credentials::CredentialCacheEntry;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::{IsolationPolicy, ValidationRuleError};

/// Rule category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Credentials,
    Access,
    Data,
    Network,
    Audit,
}

/// Severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

/// Everything a rule may look at
pub struct RuleContext<'a> {
    pub tenant: &'a TenantAccount,
    pub registry: &'a TenantRegistry,
    /// Credentials currently cached for the tenant
    pub credentials: &'a [CredentialCacheEntry],
    /// Services whose probe assumption failed, with the reason
    pub probe_failures: &'a [(String, String)],
    pub policy: &'a IsolationPolicy,
    pub privileged_patterns: &'a [Regex],
    pub now: DateTime<Utc>,
}

impl<'a> RuleContext<'a> {
    /// Registered tenants other than the one under test
    fn other_tenants(&self) -> Vec<&'a TenantAccount> {
        self.registry
            .iter()
            .map(|t| t.as_ref())
            .filter(|t| t.code != self.tenant.code)
            .collect()
    }
}

/// Pass/fail verdict with context
#[derive(Debug, Clone)]
pub struct RuleOutcome {
    pub passed: bool,
    pub message: String,
    pub details: BTreeMap<String, Value>,
}

impl RuleOutcome {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Pass when `violations` is empty, otherwise fail listing them
    fn from_violations(violations: Vec<String>, ok: &str, failed: &str) -> Self {
        if violations.is_empty() {
            Self::pass(ok)
        } else {
            Self::fail(format!("{}: {}", failed, violations.join("; ")))
                .with_detail("violations", violations)
        }
    }
}

/// Rule check function
pub type RuleCheck = fn(&RuleContext<'_>) -> Result<RuleOutcome, ValidationRuleError>;

/// Static rule definition
#[derive(Clone)]
pub struct ValidationRule {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub category: RuleCategory,
    pub severity: Severity,
    pub check: RuleCheck,
}

impl fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationRule")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("severity", &self.severity)
            .finish()
    }
}

/// The process-wide rule set
pub fn builtin_rules() -> Vec<ValidationRule> {
    vec![
        ValidationRule {
            id: "CRED-001",
            name: "Credential Scope",
            description: "Credentials held for the tenant resolve to the tenant's own account",
            category: RuleCategory::Credentials,
            severity: Severity::Critical,
            check: check_credential_scope,
        },
        ValidationRule {
            id: "CRED-002",
            name: "Credential Rotation",
            description: "No cached credential is expired or older than the maximum age",
            category: RuleCategory::Credentials,
            severity: Severity::Medium,
            check: check_credential_rotation,
        },
        ValidationRule {
            id: "ACCESS-001",
            name: "Cross-Account Boundary",
            description: "Every service role ARN embeds the tenant's account id",
            category: RuleCategory::Access,
            severity: Severity::Critical,
            check: check_role_accounts,
        },
        ValidationRule {
            id: "ACCESS-002",
            name: "Least Privilege",
            description: "No service role name matches an over-privileged pattern",
            category: RuleCategory::Access,
            severity: Severity::High,
            check: check_role_privilege,
        },
        ValidationRule {
            id: "DATA-001",
            name: "Data Segregation",
            description: "Resource identifiers do not embed another tenant's account id",
            category: RuleCategory::Data,
            severity: Severity::Critical,
            check: check_foreign_accounts,
        },
        ValidationRule {
            id: "DATA-002",
            name: "Naming Convention",
            description: "Resource names do not carry another tenant's code",
            category: RuleCategory::Data,
            severity: Severity::High,
            check: check_naming,
        },
        ValidationRule {
            id: "AUDIT-001",
            name: "Audit Fields",
            description: "Account id and role ARNs are present and well formed",
            category: RuleCategory::Audit,
            severity: Severity::Medium,
            check: check_audit_fields,
        },
        ValidationRule {
            id: "NETWORK-001",
            name: "Region Restriction",
            description: "Tenant region is an allowed region",
            category: RuleCategory::Network,
            severity: Severity::High,
            check: check_region,
        },
    ]
}

/// Role name from `arn:aws:iam::<account>:role/<path>/<name>`
fn role_name(arn: &str) -> Option<&str> {
    let resource = arn.splitn(6, ':').nth(5)?;
    let name = resource.strip_prefix("role/")?.rsplit('/').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Byte ranges where `needle` occurs bounded by non-alphanumerics
fn segment_matches(haystack: &str, needle: &str) -> Vec<(usize, usize)> {
    if needle.is_empty() {
        return Vec::new();
    }
    let bytes = haystack.as_bytes();
    haystack
        .match_indices(needle)
        .map(|(start, _)| (start, start + needle.len()))
        .filter(|&(start, end)| {
            let before = start == 0 || !bytes[start - 1].is_ascii_alphanumeric();
            let after = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
            before && after
        })
        .collect()
}

fn check_credential_scope(ctx: &RuleContext<'_>) -> Result<RuleOutcome, ValidationRuleError> {
    let tenant = ctx.tenant;
    let mut violations: Vec<String> = ctx
        .probe_failures
        .iter()
        .map(|(service, reason)| format!("{} probe failed: {}", service, reason))
        .collect();

    for entry in ctx.credentials {
        let creds = &entry.credentials;
        if creds.tenant_code != tenant.code {
            violations.push(format!("{} issued for tenant {}", creds.role_arn, creds.tenant_code));
        }
        if creds.role_arn != tenant.role_arn(creds.service) {
            violations.push(format!("{} is not the tenant's {} role", creds.role_arn, creds.service));
        }
        match creds.role_account() {
            Some(account) if account == tenant.account_id => {}
            Some(account) => violations.push(format!("{} belongs to account {}", creds.role_arn, account)),
            None => {
                return Err(ValidationRuleError::Malformed {
                    field: "cached role ARN",
                    value: creds.role_arn.clone(),
                })
            }
        }
        if let Some(identity) = &entry.identity {
            if identity.account != tenant.account_id {
                violations.push(format!("{} resolves to account {}", creds.service, identity.account));
            }
        }
    }

    Ok(
        RuleOutcome::from_violations(violations, "credentials are scoped to the tenant account", "credential scope violated")
            .with_detail("credentials_checked", ctx.credentials.len())
            .with_detail("probe_failures", ctx.probe_failures.len()),
    )
}

fn check_credential_rotation(ctx: &RuleContext<'_>) -> Result<RuleOutcome, ValidationRuleError> {
    let max_age = chrono::Duration::from_std(ctx.policy.max_credential_age)
        .map_err(|_| ValidationRuleError::Malformed {
            field: "max_credential_age",
            value: format!("{:?}", ctx.policy.max_credential_age),
        })?;

    let mut violations = Vec::new();
    for entry in ctx.credentials {
        let creds = &entry.credentials;
        if creds.is_expired_at(ctx.now) {
            violations.push(format!("{} expired at {}", creds.service, creds.expiration));
        } else if ctx.now - creds.issued_at > max_age {
            violations.push(format!("{} issued at {} exceeds maximum age", creds.service, creds.issued_at));
        }
    }

    Ok(
        RuleOutcome::from_violations(violations, "cached credentials are fresh", "stale credentials cached")
            .with_detail("max_age_secs", ctx.policy.max_credential_age.as_secs()),
    )
}

fn check_role_accounts(ctx: &RuleContext<'_>) -> Result<RuleOutcome, ValidationRuleError> {
    let mut violations = Vec::new();
    for (service, arn) in ctx.tenant.roles.iter() {
        let account = arn_account(arn).ok_or_else(|| ValidationRuleError::Malformed {
            field: "role ARN",
            value: arn.to_string(),
        })?;
        if account != ctx.tenant.account_id {
            violations.push(format!("{} role {} is in account {}", service, arn, account));
        }
    }
    Ok(
        RuleOutcome::from_violations(violations, "all service roles live in the tenant account", "cross-account role")
            .with_detail("account_id", ctx.tenant.account_id.clone()),
    )
}

fn check_role_privilege(ctx: &RuleContext<'_>) -> Result<RuleOutcome, ValidationRuleError> {
    let mut violations = Vec::new();
    for (service, arn) in ctx.tenant.roles.iter() {
        let name = role_name(arn).ok_or_else(|| ValidationRuleError::Malformed {
            field: "role ARN",
            value: arn.to_string(),
        })?;
        if let Some(pattern) = ctx.privileged_patterns.iter().find(|p| p.is_match(name)) {
            violations.push(format!("{} role {} matches {}", service, name, pattern.as_str()));
        }
    }
    Ok(RuleOutcome::from_violations(
        violations,
        "no over-privileged roles",
        "over-privileged role",
    ))
}

fn check_foreign_accounts(ctx: &RuleContext<'_>) -> Result<RuleOutcome, ValidationRuleError> {
    let identifiers = ctx.tenant.resources.identifiers();
    let mut violations = Vec::new();
    for other in ctx.other_tenants() {
        for (field, value) in &identifiers {
            if !segment_matches(value, &other.account_id).is_empty() {
                violations.push(format!("{} {} references account {} ({})", field, value, other.account_id, other.code));
            }
        }
    }
    Ok(
        RuleOutcome::from_violations(violations, "resources reference only the tenant account", "foreign account referenced")
            .with_detail("identifiers_checked", identifiers.len()),
    )
}

fn check_naming(ctx: &RuleContext<'_>) -> Result<RuleOutcome, ValidationRuleError> {
    let own = ctx.tenant.code.as_str();
    let identifiers = ctx.tenant.resources.identifiers();
    let mut violations = Vec::new();

    for (field, value) in &identifiers {
        let lowered = value.to_lowercase();
        let own_ranges = segment_matches(&lowered, own);

        for other in ctx.other_tenants() {
            let foreign = segment_matches(&lowered, &other.code).into_iter().any(|(start, end)| {
                // A shorter code inside the tenant's own code is not a reference
                !own_ranges.iter().any(|&(s, e)| s <= start && end <= e)
            });
            if foreign {
                violations.push(format!("{} {} carries tenant code {}", field, value, other.code));
            }
        }
    }

    if ctx.policy.require_tenant_prefix {
        let named = [
            ("bucket", ctx.tenant.resources.bucket.as_deref()),
            (
                "notificationQueueUrl",
                ctx.tenant
                    .resources
                    .notification_queue_url
                    .as_deref()
                    .and_then(|url| url.rsplit('/').next()),
            ),
        ];
        for (field, name) in named {
            if let Some(name) = name {
                if segment_matches(&name.to_lowercase(), own).is_empty() {
                    violations.push(format!("{} {} does not carry tenant code {}", field, name, own));
                }
            }
        }
    }

    Ok(RuleOutcome::from_violations(
        violations,
        "resource names follow the tenant naming convention",
        "naming convention violated",
    ))
}

fn check_audit_fields(ctx: &RuleContext<'_>) -> Result<RuleOutcome, ValidationRuleError> {
    let tenant = ctx.tenant;
    let mut problems = Vec::new();

    if tenant.account_id.is_empty() {
        problems.push("account id missing".to_string());
    } else if tenant.account_id.len() != 12 || !tenant.account_id.bytes().all(|b| b.is_ascii_digit()) {
        problems.push(format!("account id {} is not 12 digits", tenant.account_id));
    }

    for (service, arn) in tenant.roles.iter() {
        if arn.is_empty() {
            problems.push(format!("{} role ARN missing", service));
            continue;
        }
        let parts: Vec<&str> = arn.splitn(6, ':').collect();
        let well_formed = parts.len() == 6
            && parts[0] == "arn"
            && !parts[1].is_empty()
            && parts[2] == "iam"
            && parts[4].len() == 12
            && parts[4].bytes().all(|b| b.is_ascii_digit())
            && role_name(arn).is_some();
        if !well_formed {
            problems.push(format!("{} role ARN {} is malformed", service, arn));
        }
    }

    Ok(RuleOutcome::from_violations(
        problems,
        "audit fields present and well formed",
        "audit fields invalid",
    ))
}

fn check_region(ctx: &RuleContext<'_>) -> Result<RuleOutcome, ValidationRuleError> {
    let region = ctx.tenant.region.as_str();
    if region.is_empty() {
        return Err(ValidationRuleError::Missing("region"));
    }
    let allowed = &ctx.policy.allowed_regions;
    if allowed.is_empty() || allowed.iter().any(|r| r == region) {
        Ok(RuleOutcome::pass(format!("region {} is allowed", region)).with_detail("region", region))
    } else {
        Ok(RuleOutcome::fail(format!("region {} is not allowed", region))
            .with_detail("region", region)
            .with_detail("allowed_regions", allowed.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_name() {
        assert_eq!(role_name("arn:aws:iam::111111111111:role/AdminRole"), Some("AdminRole"));
        assert_eq!(
            role_name("arn:aws:iam::111111111111:role/service/ccn-notification"),
            Some("ccn-notification")
        );
        assert_eq!(role_name("arn:aws:iam::111111111111:user/bob"), None);
        assert_eq!(role_name("garbage"), None);
    }

    #[test]
    fn test_segment_matches() {
        assert_eq!(segment_matches("globex-acme-archive", "acme"), vec![(7, 11)]);
        assert!(segment_matches("acmecorp-archive", "acme").is_empty());
        assert!(segment_matches("https://sqs/111111111111/q", "111111111111").len() == 1);
        assert!(segment_matches("x1111111111112", "111111111111").is_empty());
    }

    #[test]
    fn test_rule_ids_are_unique() {
        let rules = builtin_rules();
        let mut ids: Vec<_> = rules.iter().map(|r| r.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), rules.len());
        assert_eq!(rules.len(), 8);
    }
}
