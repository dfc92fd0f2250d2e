//! Isolation Validator
//!
//! Runs a fixed battery of rules against a tenant and the credential
//! manager's state, proving tenant boundaries are not crossed.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        ISOLATION VALIDATOR                              │
//! │                                                                         │
//! │  validate_tenant("acme")                                                │
//! │        │                                                                │
//! │        ├── report cache (TTL) ──hit──► TenantIsolationReport            │
//! │        │                                                                │
//! │  ┌─────▼───────────────────────────────────────────────────────────┐   │
//! │  │  RULES   CRED-001 CRED-002 ACCESS-001 ACCESS-002                 │   │
//! │  │          DATA-001 DATA-002 AUDIT-001  NETWORK-001                │   │
//! │  └─────┬───────────────────────────────────────────────────────────┘   │
//! │        │ every rule runs; failures and rule errors become results       │
//! │        ▼                                                                │
//! │  detect_cross_customer_access ──► access log + metrics (blocked)       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rule ids are stable. Dashboards and alerting key off them.

pub mod rules;
pub mod report;
pub mod access;
pub mod validator;

use ccn_common::serde_helpers::duration_secs;
use ccn_common::{Classify, ErrorCategory};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use rules::{builtin_rules, RuleCategory, RuleContext, RuleOutcome, Severity, ValidationRule};
pub use report::{TenantIsolationReport, ValidationResult};
pub use access::{AccessAttempt, AccessType};
pub use validator::{IsolationMetrics, IsolationSweep, IsolationValidator};

/// Isolation errors
#[derive(Debug, Clone, Error)]
pub enum IsolationError {
    #[error("unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("invalid isolation policy: {0}")]
    InvalidPolicy(String),
}

impl Classify for IsolationError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownTenant(_) => ErrorCategory::UnknownTenant,
            Self::InvalidPolicy(_) => ErrorCategory::Validation,
        }
    }
}

/// A rule that could not be evaluated. Recorded as a failed result, never
/// returned from the validator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationRuleError {
    #[error("malformed {field}: {value}")]
    Malformed { field: &'static str, value: String },

    #[error("missing {0}")]
    Missing(&'static str),
}

/// Tenant boundary policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationPolicy {
    /// Regions tenants may live in. Empty allows any region.
    pub allowed_regions: Vec<String>,
    /// Case-insensitive patterns marking an over-privileged role name
    pub privileged_role_patterns: Vec<String>,
    /// Named resources must carry the tenant's own code
    pub require_tenant_prefix: bool,
    /// Record cross-tenant access without blocking it
    pub allow_cross_tenant: bool,
    /// Oldest cached credential CRED-002 accepts
    #[serde(with = "duration_secs")]
    pub max_credential_age: Duration,
}

impl Default for IsolationPolicy {
    fn default() -> Self {
        Self {
            allowed_regions: vec![
                "us-east-1".into(),
                "us-east-2".into(),
                "us-west-2".into(),
                "eu-west-1".into(),
                "eu-central-1".into(),
            ],
            privileged_role_patterns: vec![
                "admin".into(),
                "power-?user".into(),
                "full-?access".into(),
                r"\broot\b".into(),
            ],
            require_tenant_prefix: false,
            allow_cross_tenant: false,
            max_credential_age: Duration::from_secs(12 * 3600),
        }
    }
}

/// Validator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    /// How long a report is served from cache
    #[serde(with = "duration_secs")]
    pub cache_ttl: Duration,
    /// Assume every service role before running rules
    pub probe_credentials: bool,
    /// Bound on the retained access-attempt log
    pub max_access_log: usize,
    pub policy: IsolationPolicy,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            probe_credentials: false,
            max_access_log: 1000,
            policy: IsolationPolicy::default(),
        }
    }
}
