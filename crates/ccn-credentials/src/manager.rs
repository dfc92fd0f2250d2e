//! Credential Manager

use ccn_common::tenant::cache_key;
use ccn_common::{Classify, MetricsSink, NoopSink, ServiceKind, TenantAccount, TenantRegistry};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;

use crate::cache::{CacheEntryStatus, CredentialCache, CredentialCacheEntry};
use crate::error::CredentialError;
use crate::exchange::{AssumeRoleRequest, ExchangeError, IdentityExchange};
use crate::model::{CallerIdentity, CredentialValidation, ScopedClientConfig, ScopedCredentials, ValidationMode};
use crate::CredentialConfig;

/// STS limit on role session names
const MAX_SESSION_NAME_LEN: usize = 64;

/// Credential manager statistics
#[derive(Debug, Default)]
struct CredentialStats {
    assumptions: AtomicU64,
    cache_hits: AtomicU64,
    refreshes: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
    validations: AtomicU64,
}

/// Point-in-time credential counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CredentialMetrics {
    pub assumptions: u64,
    pub cache_hits: u64,
    pub refreshes: u64,
    pub failures: u64,
    pub evictions: u64,
    pub validations: u64,
    pub cached_keys: usize,
}

/// Assumes, caches and validates per-tenant, per-service credentials
pub struct CredentialManager {
    registry: Arc<TenantRegistry>,
    exchange: Arc<dyn IdentityExchange>,
    cache: CredentialCache,
    config: CredentialConfig,
    stats: CredentialStats,
    sink: Arc<dyn MetricsSink>,
}

impl CredentialManager {
    pub fn new(
        registry: Arc<TenantRegistry>,
        exchange: Arc<dyn IdentityExchange>,
        config: CredentialConfig,
    ) -> Self {
        Self {
            registry,
            exchange,
            cache: CredentialCache::new(),
            config,
            stats: CredentialStats::default(),
            sink: Arc::new(NoopSink),
        }
    }

    /// Route metrics to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    fn resolve(&self, tenant: &str) -> Result<Arc<TenantAccount>, CredentialError> {
        Ok(self.registry.require(tenant)?)
    }

    /// Assume the tenant's role for `service`, overwriting any cached entry
    pub async fn assume_role(
        &self,
        tenant: &str,
        service: ServiceKind,
    ) -> Result<ScopedCredentials, CredentialError> {
        let account = self.resolve(tenant)?;
        let slot = self.cache.slot(&cache_key(tenant, service));
        let mut guard = slot.lock().await;

        let entry = self.exchange_for(&account, service).await?;
        let credentials = entry.credentials.clone();
        *guard = Some(entry);
        Ok(credentials)
    }

    /// Cached credentials if they outlive the safety margin, otherwise a
    /// fresh assumption. Callers for the same key wait for a single refresh.
    pub async fn get_cached_or_assume(
        &self,
        tenant: &str,
        service: ServiceKind,
    ) -> Result<ScopedCredentials, CredentialError> {
        let account = self.resolve(tenant)?;
        let key = cache_key(tenant, service);
        let slot = self.cache.slot(&key);
        let mut guard = slot.lock().await;

        let margin = self.config.safety_margin;
        if let Some(entry) = guard.as_ref() {
            if entry.credentials.is_usable_at(Utc::now(), margin) {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.credentials.clone());
            }
            tracing::debug!(
                key = %key,
                expiration = %entry.credentials.expiration,
                "Cached credentials inside safety margin, refreshing"
            );
            self.stats.refreshes.fetch_add(1, Ordering::Relaxed);
            self.sink.increment(
                "ccn_credential_refreshes_total",
                &[("tenant", tenant.to_string()), ("service", service.to_string())],
                1,
            );
            *guard = None;
        }

        let entry = self.exchange_for(&account, service).await?;
        if !entry.credentials.is_usable_at(Utc::now(), margin) {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            return Err(CredentialError::Validation {
                tenant: tenant.to_string(),
                reason: format!(
                    "issued credentials expire at {}, inside the {}s safety margin",
                    entry.credentials.expiration,
                    margin.as_secs()
                ),
            });
        }

        let credentials = entry.credentials.clone();
        *guard = Some(entry);
        Ok(credentials)
    }

    /// Run the exchange for one tenant/service pair
    async fn exchange_for(
        &self,
        account: &TenantAccount,
        service: ServiceKind,
    ) -> Result<CredentialCacheEntry, CredentialError> {
        let tenant = account.code.as_str();
        let role_arn = account.role_arn(service);
        let request = AssumeRoleRequest {
            role_arn: role_arn.to_string(),
            session_name: self.session_name(tenant, service),
            duration: self.config.session_duration,
            external_id: account.external_id.clone(),
        };
        let labels = [("tenant", tenant.to_string()), ("service", service.to_string())];

        let started = Instant::now();
        let outcome = timeout(self.config.assume_timeout, self.exchange.assume_role(&request)).await;
        self.sink.histogram(
            "ccn_credential_assume_seconds",
            &labels,
            started.elapsed().as_secs_f64(),
        );

        let issued = match outcome {
            Ok(Ok(issued)) => issued,
            Ok(Err(ExchangeError::Denied(message))) => {
                tracing::warn!(tenant = %tenant, service = %service, role = %role_arn, "Role assumption denied: {}", message);
                self.record_failure(&labels);
                return Err(CredentialError::Denied {
                    tenant: tenant.to_string(),
                    service,
                    message,
                });
            }
            Ok(Err(source)) => {
                tracing::warn!(tenant = %tenant, service = %service, error = %source, "Role assumption failed");
                self.record_failure(&labels);
                return Err(CredentialError::RoleAssumption {
                    tenant: tenant.to_string(),
                    service,
                    source,
                });
            }
            Err(_) => {
                tracing::warn!(tenant = %tenant, service = %service, "Role assumption timed out");
                self.record_failure(&labels);
                return Err(CredentialError::Timeout {
                    tenant: tenant.to_string(),
                    operation: "assume_role",
                });
            }
        };

        let credentials = ScopedCredentials::new(
            issued.access_key_id,
            issued.secret_access_key,
            issued.session_token,
            issued.expiration,
            tenant,
            role_arn,
            service,
            &account.region,
        );

        let identity = if self.config.verify_identity {
            self.resolve_identity(account, &credentials).await?
        } else {
            None
        };

        self.stats.assumptions.fetch_add(1, Ordering::Relaxed);
        self.sink.increment("ccn_credential_assumptions_total", &labels, 1);
        tracing::info!(
            tenant = %tenant,
            service = %service,
            expiration = %credentials.expiration,
            "Assumed tenant role"
        );

        Ok(CredentialCacheEntry {
            credentials,
            inserted_at: Utc::now(),
            identity,
        })
    }

    /// Resolve the identity behind `credentials` and require it to sit in
    /// the tenant's own account
    async fn resolve_identity(
        &self,
        account: &TenantAccount,
        credentials: &ScopedCredentials,
    ) -> Result<Option<CallerIdentity>, CredentialError> {
        let tenant = account.code.as_str();
        let identity = match timeout(self.config.assume_timeout, self.exchange.caller_identity(credentials)).await {
            Ok(Ok(identity)) => identity,
            Ok(Err(source)) if source.is_retryable() => {
                return Err(CredentialError::IdentityLookup {
                    tenant: tenant.to_string(),
                    source,
                });
            }
            Ok(Err(source)) => {
                return Err(CredentialError::Validation {
                    tenant: tenant.to_string(),
                    reason: format!("identity resolution failed: {}", source),
                });
            }
            Err(_) => {
                return Err(CredentialError::Timeout {
                    tenant: tenant.to_string(),
                    operation: "caller_identity",
                });
            }
        };

        if identity.account != account.account_id {
            tracing::error!(
                tenant = %tenant,
                expected = %account.account_id,
                resolved = %identity.account,
                "Credentials resolve outside the tenant account"
            );
            return Err(CredentialError::Validation {
                tenant: tenant.to_string(),
                reason: format!(
                    "credentials resolve to account {}, expected {}",
                    identity.account, account.account_id
                ),
            });
        }
        Ok(Some(identity))
    }

    /// Validate credentials. A failed validation evicts the matching cache
    /// entry.
    pub async fn validate(
        &self,
        credentials: &ScopedCredentials,
        mode: ValidationMode,
    ) -> Result<CredentialValidation, CredentialError> {
        self.stats.validations.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let tenant = credentials.tenant_code.as_str();

        if credentials.is_expired_at(now) {
            self.evict(credentials);
            return Err(CredentialError::Validation {
                tenant: tenant.to_string(),
                reason: format!("credentials expired at {}", credentials.expiration),
            });
        }

        let account = self.resolve(tenant)?;
        let identity = match mode {
            ValidationMode::ExpiryOnly => None,
            ValidationMode::Full => match self.resolve_identity(&account, credentials).await {
                Ok(identity) => identity,
                Err(err @ CredentialError::Validation { .. }) => {
                    self.evict(credentials);
                    return Err(err);
                }
                Err(err) => return Err(err),
            },
        };

        Ok(CredentialValidation {
            tenant_code: tenant.to_string(),
            role_arn: credentials.role_arn.clone(),
            mode,
            identity,
            remaining_secs: credentials.remaining_at(now).as_secs(),
            checked_at: now,
        })
    }

    fn evict(&self, credentials: &ScopedCredentials) {
        let key = cache_key(&credentials.tenant_code, credentials.service);
        if self.cache.evict_if(&key, &credentials.access_key_id) {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::info!(key = %key, "Evicted invalid credentials");
        }
    }

    fn record_failure(&self, labels: &[(&'static str, String)]) {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        self.sink.increment("ccn_credential_failures_total", labels, 1);
    }

    /// Validated configuration for a tenant operation
    pub async fn scoped_config(
        &self,
        tenant: &str,
        service: ServiceKind,
    ) -> Result<ScopedClientConfig, CredentialError> {
        let account = self.resolve(tenant)?;
        let credentials = self.get_cached_or_assume(tenant, service).await?;
        self.validate(&credentials, ValidationMode::ExpiryOnly).await?;

        Ok(ScopedClientConfig {
            region: account.region.clone(),
            tenant: account,
            service,
            credentials,
        })
    }

    /// Drop one cached entry
    pub fn invalidate(&self, tenant: &str, service: ServiceKind) -> bool {
        let removed = self.cache.remove(&cache_key(tenant, service));
        if removed {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Cached entry without assuming or waiting
    pub fn cached(&self, tenant: &str, service: ServiceKind) -> Option<CredentialCacheEntry> {
        self.cache.peek(&cache_key(tenant, service))
    }

    /// Every cached entry for a tenant
    pub fn cached_for_tenant(&self, tenant: &str) -> Vec<CredentialCacheEntry> {
        self.cache.entries_for_tenant(tenant)
    }

    /// Drop all cached credentials
    pub fn clear_cache(&self) -> usize {
        let cleared = self.cache.clear();
        self.stats.evictions.fetch_add(cleared as u64, Ordering::Relaxed);
        tracing::info!(cleared, "Credential cache cleared");
        cleared
    }

    /// Expiry per cached key
    pub fn cache_status(&self) -> BTreeMap<String, CacheEntryStatus> {
        self.cache.status(Utc::now())
    }

    pub fn metrics(&self) -> CredentialMetrics {
        CredentialMetrics {
            assumptions: self.stats.assumptions.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            refreshes: self.stats.refreshes.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            validations: self.stats.validations.load(Ordering::Relaxed),
            cached_keys: self.cache.len(),
        }
    }

    fn session_name(&self, tenant: &str, service: ServiceKind) -> String {
        let mut name = format!(
            "{}-{}-{}-{}",
            self.config.session_name_prefix,
            tenant,
            service,
            Utc::now().timestamp()
        );
        name.truncate(MAX_SESSION_NAME_LEN);
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::StaticExchange;
    use ccn_common::tenant::fixtures;
    use ccn_common::{ErrorCategory, RecordingSink};
    use std::time::Duration;

    fn manager_with(exchange: Arc<StaticExchange>) -> Arc<CredentialManager> {
        Arc::new(CredentialManager::new(
            Arc::new(fixtures::registry()),
            exchange,
            CredentialConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_cache_hit_after_assumption() {
        let exchange = Arc::new(StaticExchange::new());
        let manager = manager_with(exchange.clone());

        let first = manager.get_cached_or_assume("acme", ServiceKind::Notification).await.unwrap();
        let second = manager.get_cached_or_assume("acme", ServiceKind::Notification).await.unwrap();

        assert_eq!(first.access_key_id, second.access_key_id);
        assert_eq!(first.role_arn, "arn:aws:iam::111111111111:role/ccn-notification");
        assert_eq!(exchange.assume_calls(), 1);
        assert_eq!(manager.metrics().cache_hits, 1);
        assert!(manager.cache_status().contains_key("acme:notification"));
    }

    #[tokio::test]
    async fn test_refresh_inside_safety_margin() {
        let exchange = Arc::new(StaticExchange::new().with_lifetime(chrono::Duration::minutes(4)));
        let manager = manager_with(exchange.clone());

        // Direct assumption caches whatever the exchange issues
        let short = manager.assume_role("acme", ServiceKind::Queue).await.unwrap();
        assert!(short.remaining_at(Utc::now()) < manager.config().safety_margin);

        exchange.set_lifetime(chrono::Duration::hours(1));
        let fresh = manager.get_cached_or_assume("acme", ServiceKind::Queue).await.unwrap();

        assert_ne!(short.access_key_id, fresh.access_key_id);
        assert!(fresh.remaining_at(Utc::now()) > manager.config().safety_margin);
        assert_eq!(exchange.assume_calls(), 2);
        assert_eq!(manager.metrics().refreshes, 1);
    }

    #[tokio::test]
    async fn test_short_lived_issue_is_rejected() {
        let exchange = Arc::new(StaticExchange::new().with_lifetime(chrono::Duration::minutes(2)));
        let manager = manager_with(exchange);

        let err = manager
            .get_cached_or_assume("acme", ServiceKind::Queue)
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Validation { .. }));
        assert!(manager.cached("acme", ServiceKind::Queue).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_refresh() {
        let exchange = Arc::new(StaticExchange::new().with_latency(Duration::from_millis(200)));
        let manager = manager_with(exchange.clone());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.get_cached_or_assume("acme", ServiceKind::Storage).await
            }));
        }
        let other = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_cached_or_assume("globex", ServiceKind::Storage).await })
        };

        let mut keys = Vec::new();
        for handle in handles {
            keys.push(handle.await.unwrap().unwrap().access_key_id);
        }
        other.await.unwrap().unwrap();

        keys.dedup();
        assert_eq!(keys.len(), 1);
        assert_eq!(exchange.assume_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_during_refresh_does_not_start_second_assumption() {
        let exchange = Arc::new(StaticExchange::new().with_latency(Duration::from_millis(200)));
        let manager = manager_with(exchange.clone());

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_cached_or_assume("acme", ServiceKind::Queue).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(exchange.assume_calls(), 1);

        assert_eq!(manager.clear_cache(), 0);
        let second = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_cached_or_assume("acme", ServiceKind::Queue).await })
        };

        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();
        assert_eq!(a.access_key_id, b.access_key_id);
        assert_eq!(exchange.assume_calls(), 1);
        assert_eq!(manager.metrics().cached_keys, 1);
    }

    #[tokio::test]
    async fn test_unknown_tenant_and_denial() {
        let exchange = Arc::new(StaticExchange::new());
        exchange.deny_role("arn:aws:iam::222222222222:role/ccn-queue");
        let sink = RecordingSink::new();
        let manager = CredentialManager::new(
            Arc::new(fixtures::registry()),
            exchange,
            CredentialConfig::default(),
        )
        .with_sink(sink.clone());

        let unknown = manager.assume_role("initech", ServiceKind::Queue).await.unwrap_err();
        assert_eq!(unknown.category(), ErrorCategory::UnknownTenant);

        let denied = manager.assume_role("globex", ServiceKind::Queue).await.unwrap_err();
        assert!(matches!(denied, CredentialError::Denied { .. }));
        assert!(!denied.is_retryable());
        assert!(manager.cached("globex", ServiceKind::Queue).is_none());
        assert_eq!(sink.counter("ccn_credential_failures_total"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_timeout() {
        let exchange = Arc::new(StaticExchange::new().with_latency(Duration::from_secs(30)));
        let manager = manager_with(exchange);

        let err = manager.assume_role("acme", ServiceKind::Queue).await.unwrap_err();
        assert!(matches!(err, CredentialError::Timeout { operation: "assume_role", .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_full_validation_evicts_foreign_identity() {
        let exchange = Arc::new(StaticExchange::new());
        let manager = Arc::new(CredentialManager::new(
            Arc::new(fixtures::registry()),
            exchange.clone(),
            CredentialConfig {
                verify_identity: false,
                ..CredentialConfig::default()
            },
        ));

        let creds = manager.get_cached_or_assume("acme", ServiceKind::Notification).await.unwrap();
        let ok = manager.validate(&creds, ValidationMode::Full).await.unwrap();
        assert_eq!(ok.identity.unwrap().account, "111111111111");

        exchange.override_identity(
            &creds.role_arn,
            CallerIdentity {
                account: "222222222222".into(),
                arn: "arn:aws:sts::222222222222:assumed-role/x/y".into(),
                user_id: "AROA:y".into(),
            },
        );
        let err = manager.validate(&creds, ValidationMode::Full).await.unwrap_err();
        assert!(matches!(err, CredentialError::Validation { .. }));
        assert!(manager.cached("acme", ServiceKind::Notification).is_none());
        assert_eq!(manager.metrics().evictions, 1);
    }

    #[tokio::test]
    async fn test_expiry_only_validation_rejects_expired() {
        let manager = manager_with(Arc::new(StaticExchange::new()));
        let expired = ScopedCredentials::new(
            "AKIAOLD".into(),
            "s".into(),
            "t".into(),
            Utc::now() - chrono::Duration::seconds(1),
            "acme",
            "arn:aws:iam::111111111111:role/ccn-queue",
            ServiceKind::Queue,
            "us-east-1",
        );
        let err = manager.validate(&expired, ValidationMode::ExpiryOnly).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Credentials);
    }

    #[tokio::test]
    async fn test_scoped_config_and_admin_ops() {
        let manager = manager_with(Arc::new(StaticExchange::new()));

        let scoped = manager.scoped_config("globex", ServiceKind::Notification).await.unwrap();
        assert_eq!(scoped.tenant.code, "globex");
        assert_eq!(scoped.region, "us-east-1");
        assert_eq!(scoped.credentials.tenant_code, "globex");

        manager.get_cached_or_assume("acme", ServiceKind::Queue).await.unwrap();
        assert_eq!(manager.cache_status().len(), 2);
        assert!(manager.invalidate("acme", ServiceKind::Queue));
        assert!(!manager.invalidate("acme", ServiceKind::Queue));
        assert_eq!(manager.clear_cache(), 1);
        assert!(manager.cache_status().is_empty());
    }

    #[test]
    fn test_session_name_truncated() {
        let manager = CredentialManager::new(
            Arc::new(fixtures::registry()),
            Arc::new(StaticExchange::new()),
            CredentialConfig {
                session_name_prefix: "x".repeat(60),
                ..CredentialConfig::default()
            },
        );
        let name = manager.session_name("acme", ServiceKind::Notification);
        assert_eq!(name.len(), MAX_SESSION_NAME_LEN);
    }
}
