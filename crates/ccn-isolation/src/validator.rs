//! Isolation Validator

use ccn_common::{Classify, MetricsSink, NoopSink, ServiceKind};
use ccn_credentials::{CredentialManager, ValidationMode};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

use crate::access::{AccessAttempt, AccessType};
use crate::report::{TenantIsolationReport, ValidationResult};
use crate::rules::{builtin_rules, RuleContext, ValidationRule};
use crate::{IsolationConfig, IsolationError};

struct CachedReport {
    report: Arc<TenantIsolationReport>,
    cached_at: Instant,
}

/// Result of validating every registered tenant
#[derive(Debug, Clone, Default, Serialize)]
pub struct IsolationSweep {
    pub reports: BTreeMap<String, Arc<TenantIsolationReport>>,
    pub errors: BTreeMap<String, String>,
}

impl IsolationSweep {
    /// Tenants with at least one failed rule
    pub fn failing_tenants(&self) -> Vec<&str> {
        self.reports
            .iter()
            .filter(|(_, report)| !report.is_isolated())
            .map(|(code, _)| code.as_str())
            .collect()
    }
}

/// Point-in-time validator counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct IsolationMetrics {
    pub evaluations: u64,
    pub cache_hits: u64,
    pub rule_failures: u64,
    pub cross_tenant_attempts: u64,
    pub blocked_attempts: u64,
}

#[derive(Debug, Default)]
struct IsolationStats {
    evaluations: AtomicU64,
    cache_hits: AtomicU64,
    rule_failures: AtomicU64,
    cross_tenant_attempts: AtomicU64,
    blocked_attempts: AtomicU64,
}

/// Rule engine over the credential manager's state
pub struct IsolationValidator {
    credentials: Arc<CredentialManager>,
    rules: Vec<ValidationRule>,
    config: IsolationConfig,
    privileged_patterns: Vec<Regex>,
    cache: DashMap<String, CachedReport>,
    access_log: Mutex<VecDeque<AccessAttempt>>,
    stats: IsolationStats,
    sink: Arc<dyn MetricsSink>,
}

impl IsolationValidator {
    /// Build a validator with the built-in rule set. Fails on an invalid
    /// privileged-role pattern.
    pub fn new(credentials: Arc<CredentialManager>, config: IsolationConfig) -> Result<Self, IsolationError> {
        let privileged_patterns = config
            .policy
            .privileged_role_patterns
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| IsolationError::InvalidPolicy(format!("pattern {:?}: {}", pattern, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            credentials,
            rules: builtin_rules(),
            config,
            privileged_patterns,
            cache: DashMap::new(),
            access_log: Mutex::new(VecDeque::new()),
            stats: IsolationStats::default(),
            sink: Arc::new(NoopSink),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn rules(&self) -> &[ValidationRule] {
        &self.rules
    }

    pub fn config(&self) -> &IsolationConfig {
        &self.config
    }

    /// Run every rule against `tenant`, serving a cached report inside the TTL
    pub async fn validate_tenant(&self, tenant: &str) -> Result<Arc<TenantIsolationReport>, IsolationError> {
        let account = self
            .credentials
            .registry()
            .get(tenant)
            .ok_or_else(|| IsolationError::UnknownTenant(tenant.to_string()))?;

        if let Some(report) = self.cached_report(tenant) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(report);
        }

        let (probe_failures, deferred) = if self.config.probe_credentials {
            self.probe(tenant).await
        } else {
            (Vec::new(), Vec::new())
        };
        let cached = self.credentials.cached_for_tenant(tenant);

        let ctx = RuleContext {
            tenant: &account,
            registry: self.credentials.registry(),
            credentials: &cached,
            probe_failures: &probe_failures,
            policy: &self.config.policy,
            privileged_patterns: &self.privileged_patterns,
            now: Utc::now(),
        };

        let results: Vec<ValidationResult> = self.rules.iter().map(|rule| self.run_rule(rule, &ctx)).collect();
        let report = Arc::new(TenantIsolationReport::new(tenant, results).with_deferred_checks(deferred));

        self.stats.evaluations.fetch_add(1, Ordering::Relaxed);
        self.stats.rule_failures.fetch_add(report.failed as u64, Ordering::Relaxed);
        if report.is_isolated() {
            tracing::debug!(tenant = %tenant, rules = report.results.len(), "Tenant isolation verified");
        } else {
            tracing::warn!(
                tenant = %tenant,
                failed = ?report.failed_rule_ids(),
                "Tenant isolation rules failed"
            );
        }

        if report.is_conclusive() {
            self.cache.insert(
                tenant.to_string(),
                CachedReport {
                    report: report.clone(),
                    cached_at: Instant::now(),
                },
            );
        } else {
            self.cache.remove(tenant);
            tracing::warn!(
                tenant = %tenant,
                deferred = ?report.deferred_checks,
                "Credential checks hit transient errors, report not cached"
            );
        }
        Ok(report)
    }

    fn run_rule(&self, rule: &ValidationRule, ctx: &RuleContext<'_>) -> ValidationResult {
        let started = std::time::Instant::now();
        let outcome = (rule.check)(ctx);
        let duration_micros = started.elapsed().as_micros() as u64;

        let (passed, message, details) = match outcome {
            Ok(outcome) => (outcome.passed, outcome.message, outcome.details),
            Err(e) => {
                tracing::warn!(rule = rule.id, tenant = %ctx.tenant.code, error = %e, "Rule could not be evaluated");
                let mut details = BTreeMap::new();
                details.insert("error".to_string(), serde_json::Value::from(e.to_string()));
                (false, format!("rule error: {}", e), details)
            }
        };

        if !passed {
            self.sink.increment(
                "ccn_isolation_rule_failures_total",
                &[("rule", rule.id.to_string()), ("tenant", ctx.tenant.code.clone())],
                1,
            );
        }

        ValidationResult {
            rule_id: rule.id.to_string(),
            rule_name: rule.name.to_string(),
            category: rule.category,
            severity: rule.severity,
            tenant_code: ctx.tenant.code.clone(),
            passed,
            message,
            details,
            timestamp: Utc::now(),
            duration_micros,
        }
    }

    /// Assume and expiry-check every service role for the tenant. Returns the
    /// conclusive failures and, separately, the services whose check hit a
    /// retryable error.
    async fn probe(&self, tenant: &str) -> (Vec<(String, String)>, Vec<String>) {
        let mut failures = Vec::new();
        let mut deferred = Vec::new();
        for service in ServiceKind::ALL {
            let result = match self.credentials.get_cached_or_assume(tenant, service).await {
                Ok(creds) => self
                    .credentials
                    .validate(&creds, ValidationMode::ExpiryOnly)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    tracing::debug!(tenant = %tenant, service = %service, error = %e, "Credential check deferred");
                    deferred.push(service.to_string());
                }
                Err(e) => failures.push((service.to_string(), e.to_string())),
            }
        }
        (failures, deferred)
    }

    /// Validate every registered tenant, continuing past per-tenant errors
    pub async fn validate_all(&self) -> IsolationSweep {
        let mut sweep = IsolationSweep::default();
        for code in self.credentials.registry().codes() {
            match self.validate_tenant(&code).await {
                Ok(report) => {
                    sweep.reports.insert(code, report);
                }
                Err(e) => {
                    tracing::warn!(tenant = %code, error = %e, "Tenant validation failed");
                    sweep.errors.insert(code, e.to_string());
                }
            }
        }
        tracing::info!(
            tenants = sweep.reports.len(),
            failing = sweep.failing_tenants().len(),
            errors = sweep.errors.len(),
            "Isolation sweep complete"
        );
        sweep
    }

    /// Report cached for `tenant`, if still inside the TTL
    pub fn cached_report(&self, tenant: &str) -> Option<Arc<TenantIsolationReport>> {
        let entry = self.cache.get(tenant)?;
        if entry.cached_at.elapsed() < self.config.cache_ttl {
            Some(entry.report.clone())
        } else {
            None
        }
    }

    /// Drop every cached report
    pub fn clear_cache(&self) -> usize {
        let count = self.cache.len();
        self.cache.clear();
        count
    }

    /// Drop one tenant's cached report
    pub fn expire(&self, tenant: &str) -> bool {
        self.cache.remove(tenant).is_some()
    }

    /// Record an access by `source`'s context to `target`'s resource.
    /// Cross-tenant access is blocked unless the policy allows it.
    pub fn detect_cross_customer_access(
        &self,
        source: &str,
        target: &str,
        access_type: AccessType,
        resource: &str,
    ) -> AccessAttempt {
        let registry = self.credentials.registry();
        let (blocked, reason) = if !registry.contains(source) || !registry.contains(target) {
            (true, "unknown tenant in access attempt".to_string())
        } else if source == target {
            (false, "same tenant".to_string())
        } else if self.config.policy.allow_cross_tenant {
            (false, "cross-tenant access allowed by policy".to_string())
        } else {
            (true, "cross-tenant access is forbidden".to_string())
        };

        let attempt = AccessAttempt {
            source_tenant: source.to_string(),
            target_tenant: target.to_string(),
            access_type,
            resource: resource.to_string(),
            blocked,
            reason,
            timestamp: Utc::now(),
        };

        if attempt.is_cross_tenant() || blocked {
            self.stats.cross_tenant_attempts.fetch_add(1, Ordering::Relaxed);
            if blocked {
                self.stats.blocked_attempts.fetch_add(1, Ordering::Relaxed);
            }
            tracing::warn!(
                source = %source,
                target = %target,
                access = %access_type,
                resource = %resource,
                blocked,
                "Cross-tenant access attempt"
            );
            self.sink.increment(
                "ccn_cross_tenant_attempts_total",
                &[
                    ("source", source.to_string()),
                    ("target", target.to_string()),
                    ("blocked", blocked.to_string()),
                ],
                1,
            );

            let mut log = self.access_log.lock();
            if log.len() >= self.config.max_access_log.max(1) {
                log.pop_front();
            }
            log.push_back(attempt.clone());
        }

        attempt
    }

    /// Check `source` touching `resource` in its own context. The owner is
    /// the registered tenant whose account id appears in the resource,
    /// preferring `source` itself; a resource naming no registered account
    /// is attributed to `source`.
    pub fn check_resource_access(&self, source: &str, access_type: AccessType, resource: &str) -> AccessAttempt {
        let registry = self.credentials.registry();
        let own = registry
            .get(source)
            .map(|account| resource.contains(&account.account_id))
            .unwrap_or(false);
        let owner = if own {
            source.to_string()
        } else {
            registry
                .iter()
                .find(|account| account.code != source && resource.contains(&account.account_id))
                .map(|account| account.code.clone())
                .unwrap_or_else(|| source.to_string())
        };
        self.detect_cross_customer_access(source, &owner, access_type, resource)
    }

    /// Retained cross-tenant attempts, oldest first
    pub fn access_attempts(&self) -> Vec<AccessAttempt> {
        self.access_log.lock().iter().cloned().collect()
    }

    pub fn metrics(&self) -> IsolationMetrics {
        IsolationMetrics {
            evaluations: self.stats.evaluations.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            rule_failures: self.stats.rule_failures.load(Ordering::Relaxed),
            cross_tenant_attempts: self.stats.cross_tenant_attempts.load(Ordering::Relaxed),
            blocked_attempts: self.stats.blocked_attempts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccn_common::tenant::fixtures;
    use ccn_common::{RecordingSink, TenantAccount, TenantRegistry};
    use ccn_credentials::{CallerIdentity, CredentialConfig, ExchangeError, StaticExchange};
    use std::time::Duration;

    fn validator_for(tenants: Vec<TenantAccount>, config: IsolationConfig) -> (IsolationValidator, Arc<StaticExchange>) {
        let exchange = Arc::new(StaticExchange::new());
        let credentials = Arc::new(CredentialManager::new(
            Arc::new(TenantRegistry::new(tenants).unwrap()),
            exchange.clone(),
            CredentialConfig::default(),
        ));
        (IsolationValidator::new(credentials, config).unwrap(), exchange)
    }

    fn standard() -> Vec<TenantAccount> {
        vec![
            fixtures::tenant("acme", "111111111111"),
            fixtures::tenant("globex", "222222222222"),
        ]
    }

    #[tokio::test]
    async fn test_clean_tenant_passes_every_rule() {
        let (validator, _) = validator_for(standard(), IsolationConfig::default());
        let report = validator.validate_tenant("acme").await.unwrap();

        assert_eq!(report.results.len(), validator.rules().len());
        assert!(report.is_isolated(), "failed: {:?}", report.failed_rule_ids());
        assert_eq!(report.passed, 8);
    }

    #[tokio::test]
    async fn test_admin_role_fails_least_privilege() {
        let mut acme = fixtures::tenant("acme", "111111111111");
        acme.roles.notification_role_arn = "arn:aws:iam::111111111111:role/AdminRole".into();
        let (validator, _) = validator_for(vec![acme], IsolationConfig::default());

        let report = validator.validate_tenant("acme").await.unwrap();
        let result = report.result("ACCESS-002").unwrap();
        assert!(!result.passed);
        assert!(result.message.contains("AdminRole"));
        assert_eq!(report.results.len(), 8);
        assert!(report.blocking_failures().iter().any(|r| r.rule_id == "ACCESS-002"));
    }

    #[tokio::test]
    async fn test_cross_account_role_and_resources() {
        let mut acme = fixtures::tenant("acme", "111111111111");
        acme.roles.queue_role_arn = "arn:aws:iam::222222222222:role/ccn-queue".into();
        acme.resources.notification_queue_url =
            Some("https://sqs.us-east-1.amazonaws.com/222222222222/acme-notifications".into());
        acme.resources.bucket = Some("globex-shared-archive".into());
        let mut tenants = vec![acme];
        tenants.push(fixtures::tenant("globex", "222222222222"));
        let (validator, _) = validator_for(tenants, IsolationConfig::default());

        let report = validator.validate_tenant("acme").await.unwrap();
        let failed = report.failed_rule_ids();
        assert!(failed.contains(&"ACCESS-001"));
        assert!(failed.contains(&"DATA-001"));
        assert!(failed.contains(&"DATA-002"));
        assert_eq!(report.results.len(), 8);
    }

    #[tokio::test]
    async fn test_naming_ignores_codes_inside_own_code() {
        let mut acme_eu = fixtures::tenant("acme-eu", "333333333333");
        acme_eu.resources.bucket = Some("acme-eu-archive".into());
        let (validator, _) = validator_for(
            vec![fixtures::tenant("acme", "111111111111"), acme_eu],
            IsolationConfig::default(),
        );

        let report = validator.validate_tenant("acme-eu").await.unwrap();
        assert!(report.result("DATA-002").unwrap().passed);

        // The reverse is a real reference
        let mut acme = fixtures::tenant("acme", "111111111111");
        acme.resources.bucket = Some("acme-eu-archive".into());
        let (validator, _) = validator_for(
            vec![acme, fixtures::tenant("acme-eu", "333333333333")],
            IsolationConfig::default(),
        );
        let report = validator.validate_tenant("acme").await.unwrap();
        assert!(!report.result("DATA-002").unwrap().passed);
    }

    #[tokio::test]
    async fn test_rule_error_recorded_as_failure() {
        let mut acme = fixtures::tenant("acme", "111111111111");
        acme.roles.storage_role_arn = "not-an-arn".into();
        let (validator, _) = validator_for(vec![acme], IsolationConfig::default());

        let report = validator.validate_tenant("acme").await.unwrap();
        assert_eq!(report.results.len(), 8);
        let access = report.result("ACCESS-001").unwrap();
        assert!(!access.passed);
        assert!(access.details.contains_key("error"));
        assert!(!report.result("AUDIT-001").unwrap().passed);
    }

    #[tokio::test]
    async fn test_region_and_prefix_policy() {
        let mut acme = fixtures::tenant("acme", "111111111111");
        acme.region = "ap-south-1".into();
        acme.resources.bucket = Some("shared-archive".into());
        let config = IsolationConfig {
            policy: crate::IsolationPolicy {
                require_tenant_prefix: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let (validator, _) = validator_for(vec![acme], config);

        let report = validator.validate_tenant("acme").await.unwrap();
        assert!(!report.result("NETWORK-001").unwrap().passed);
        assert!(!report.result("DATA-002").unwrap().passed);
    }

    #[tokio::test]
    async fn test_probe_detects_foreign_identity() {
        let config = IsolationConfig {
            probe_credentials: true,
            ..Default::default()
        };
        let (validator, exchange) = validator_for(standard(), config);
        exchange.override_identity(
            "arn:aws:iam::111111111111:role/ccn-storage",
            CallerIdentity {
                account: "222222222222".into(),
                arn: "arn:aws:sts::222222222222:assumed-role/ccn-storage/s".into(),
                user_id: "AROA:s".into(),
            },
        );

        let report = validator.validate_tenant("acme").await.unwrap();
        let cred = report.result("CRED-001").unwrap();
        assert!(!cred.passed);
        assert!(cred.message.contains("storage"));
        assert_eq!(exchange.assume_calls(), 3);
    }

    #[tokio::test]
    async fn test_throttled_credential_check_is_deferred_not_failed() {
        let config = IsolationConfig {
            probe_credentials: true,
            ..Default::default()
        };
        let (validator, exchange) = validator_for(standard(), config);
        exchange.fail_next(ExchangeError::Throttled("Rate exceeded".into()));

        let report = validator.validate_tenant("acme").await.unwrap();
        assert!(report.result("CRED-001").unwrap().passed);
        assert_eq!(report.deferred_checks.len(), 1);
        assert!(report.blocking_failures().is_empty());
        assert!(validator.cached_report("acme").is_none());

        // Next evaluation is conclusive and cached
        let second = validator.validate_tenant("acme").await.unwrap();
        assert!(!Arc::ptr_eq(&report, &second));
        assert!(second.is_conclusive());
        let third = validator.validate_tenant("acme").await.unwrap();
        assert!(Arc::ptr_eq(&second, &third));
    }

    #[tokio::test]
    async fn test_denied_credential_check_still_fails() {
        let config = IsolationConfig {
            probe_credentials: true,
            ..Default::default()
        };
        let (validator, exchange) = validator_for(standard(), config);
        exchange.deny_role("arn:aws:iam::111111111111:role/ccn-queue");

        let report = validator.validate_tenant("acme").await.unwrap();
        let cred = report.result("CRED-001").unwrap();
        assert!(!cred.passed);
        assert!(cred.message.contains("queue"));
        assert!(report.is_conclusive());
        assert!(validator.cached_report("acme").is_some());
    }

    #[tokio::test]
    async fn test_expired_credentials_fail_rotation() {
        let (validator, exchange) = validator_for(standard(), IsolationConfig::default());
        exchange.set_lifetime(chrono::Duration::seconds(-5));
        validator
            .credentials
            .assume_role("acme", ServiceKind::Notification)
            .await
            .unwrap();

        let report = validator.validate_tenant("acme").await.unwrap();
        assert!(!report.result("CRED-002").unwrap().passed);
        assert!(report.result("CRED-001").unwrap().passed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_cache_ttl_and_expire() {
        let config = IsolationConfig {
            cache_ttl: Duration::from_secs(60),
            ..Default::default()
        };
        let (validator, _) = validator_for(standard(), config);

        let first = validator.validate_tenant("acme").await.unwrap();
        let second = validator.validate_tenant("acme").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        tokio::time::advance(Duration::from_secs(61)).await;
        let third = validator.validate_tenant("acme").await.unwrap();
        assert!(!Arc::ptr_eq(&second, &third));

        assert!(validator.expire("acme"));
        let fourth = validator.validate_tenant("acme").await.unwrap();
        assert!(!Arc::ptr_eq(&third, &fourth));
        assert_eq!(validator.clear_cache(), 1);
        assert_eq!(validator.metrics().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_unknown_tenant_and_sweep() {
        let (validator, _) = validator_for(standard(), IsolationConfig::default());
        assert!(matches!(
            validator.validate_tenant("initech").await,
            Err(IsolationError::UnknownTenant(_))
        ));

        let sweep = validator.validate_all().await;
        assert_eq!(sweep.reports.len(), 2);
        assert!(sweep.errors.is_empty());
        assert!(sweep.failing_tenants().is_empty());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let credentials = Arc::new(CredentialManager::new(
            Arc::new(fixtures::registry()),
            Arc::new(StaticExchange::new()),
            CredentialConfig::default(),
        ));
        let config = IsolationConfig {
            policy: crate::IsolationPolicy {
                privileged_role_patterns: vec!["(unclosed".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            IsolationValidator::new(credentials, config),
            Err(IsolationError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_cross_customer_access() {
        let credentials = Arc::new(CredentialManager::new(
            Arc::new(fixtures::registry()),
            Arc::new(StaticExchange::new()),
            CredentialConfig::default(),
        ));
        let sink = RecordingSink::new();
        let validator = IsolationValidator::new(credentials, IsolationConfig::default())
            .unwrap()
            .with_sink(sink.clone());

        let same = validator.detect_cross_customer_access("acme", "acme", AccessType::Read, "acme-change-archive");
        assert!(!same.blocked);
        assert!(validator.access_attempts().is_empty());

        let cross = validator.detect_cross_customer_access("acme", "globex", AccessType::Send, "globex-notifications");
        assert!(cross.blocked);
        assert_eq!(validator.access_attempts().len(), 1);
        assert_eq!(validator.metrics().blocked_attempts, 1);
        assert_eq!(sink.counter("ccn_cross_tenant_attempts_total"), 1);
    }

    #[test]
    fn test_resource_access_resolves_owner_from_account() {
        let (validator, _) = validator_for(standard(), IsolationConfig::default());

        let own = validator.check_resource_access(
            "acme",
            AccessType::Send,
            "https://sqs.us-east-1.amazonaws.com/111111111111/acme-notifications",
        );
        assert!(!own.blocked);
        assert_eq!(own.target_tenant, "acme");

        let foreign = validator.check_resource_access(
            "acme",
            AccessType::Send,
            "https://sqs.us-east-1.amazonaws.com/222222222222/acme-notifications",
        );
        assert!(foreign.blocked);
        assert_eq!(foreign.target_tenant, "globex");

        let unattributed = validator.check_resource_access("acme", AccessType::Write, "acme-change-archive");
        assert!(!unattributed.blocked);
        assert_eq!(validator.access_attempts().len(), 1);
        assert_eq!(validator.metrics().blocked_attempts, 1);
    }

    #[test]
    fn test_cross_access_allowed_by_policy_is_still_logged() {
        let credentials = Arc::new(CredentialManager::new(
            Arc::new(fixtures::registry()),
            Arc::new(StaticExchange::new()),
            CredentialConfig::default(),
        ));
        let config = IsolationConfig {
            max_access_log: 2,
            policy: crate::IsolationPolicy {
                allow_cross_tenant: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let validator = IsolationValidator::new(credentials, config).unwrap();

        for _ in 0..3 {
            let attempt = validator.detect_cross_customer_access("globex", "acme", AccessType::Read, "acme-change-archive");
            assert!(!attempt.blocked);
        }
        assert_eq!(validator.access_attempts().len(), 2);
        assert_eq!(validator.metrics().cross_tenant_attempts, 3);
    }
}
