//! Identity exchange collaborator

use async_trait::async_trait;
use ccn_common::{Classify, ErrorCategory};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::model::{arn_account, CallerIdentity, ScopedCredentials};

/// Role assumption request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumeRoleRequest {
    pub role_arn: String,
    pub session_name: String,
    pub duration: Duration,
    pub external_id: Option<String>,
}

/// Raw credentials returned by the exchange
#[derive(Clone)]
pub struct IssuedCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
}

impl std::fmt::Debug for IssuedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

/// Exchange failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("access denied: {0}")]
    Denied(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("exchange timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("{code}: {message}")]
    Rejected { code: String, message: String },
}

impl Classify for ExchangeError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::Denied(_) => ErrorCategory::PermissionDenied,
            Self::Throttled(_) => ErrorCategory::Throttling,
            Self::Timeout => ErrorCategory::Timeout,
            Self::Transport(_) => ErrorCategory::Network,
            Self::Malformed(_) | Self::Rejected { .. } => ErrorCategory::Internal,
        }
    }
}

/// Cloud identity / token exchange service
#[async_trait]
pub trait IdentityExchange: Send + Sync {
    /// Exchange the process identity for role credentials
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<IssuedCredentials, ExchangeError>;

    /// Resolve the identity behind a set of credentials
    async fn caller_identity(&self, credentials: &ScopedCredentials) -> Result<CallerIdentity, ExchangeError>;
}

/// Deterministic in-process exchange (for testing and local development)
///
/// Issues credentials for any role ARN and resolves them back to the
/// account embedded in that ARN, unless told otherwise.
pub struct StaticExchange {
    lifetime: RwLock<chrono::Duration>,
    latency: RwLock<Duration>,
    denied_roles: RwLock<HashSet<String>>,
    identity_overrides: RwLock<HashMap<String, CallerIdentity>>,
    scripted_failures: Mutex<VecDeque<ExchangeError>>,
    assume_calls: AtomicU64,
    identity_calls: AtomicU64,
}

impl StaticExchange {
    pub fn new() -> Self {
        Self {
            lifetime: RwLock::new(chrono::Duration::hours(1)),
            latency: RwLock::new(Duration::ZERO),
            denied_roles: RwLock::new(HashSet::new()),
            identity_overrides: RwLock::new(HashMap::new()),
            scripted_failures: Mutex::new(VecDeque::new()),
            assume_calls: AtomicU64::new(0),
            identity_calls: AtomicU64::new(0),
        }
    }

    /// Lifetime of issued credentials
    pub fn with_lifetime(self, lifetime: chrono::Duration) -> Self {
        *self.lifetime.write() = lifetime;
        self
    }

    /// Simulated round-trip latency
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.write() = latency;
        self
    }

    pub fn set_lifetime(&self, lifetime: chrono::Duration) {
        *self.lifetime.write() = lifetime;
    }

    pub fn deny_role(&self, role_arn: &str) {
        self.denied_roles.write().insert(role_arn.to_string());
    }

    /// Resolve credentials for `role_arn` to a fixed identity
    pub fn override_identity(&self, role_arn: &str, identity: CallerIdentity) {
        self.identity_overrides.write().insert(role_arn.to_string(), identity);
    }

    /// Fail the next assume call with `error`
    pub fn fail_next(&self, error: ExchangeError) {
        self.scripted_failures.lock().push_back(error);
    }

    pub fn assume_calls(&self) -> u64 {
        self.assume_calls.load(Ordering::Relaxed)
    }

    pub fn identity_calls(&self) -> u64 {
        self.identity_calls.load(Ordering::Relaxed)
    }
}

impl Default for StaticExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityExchange for StaticExchange {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<IssuedCredentials, ExchangeError> {
        let call = self.assume_calls.fetch_add(1, Ordering::Relaxed) + 1;

        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.scripted_failures.lock().pop_front() {
            return Err(error);
        }
        if self.denied_roles.read().contains(&request.role_arn) {
            return Err(ExchangeError::Denied(format!(
                "not authorized to perform sts:AssumeRole on {}",
                request.role_arn
            )));
        }
        if arn_account(&request.role_arn).is_none() {
            return Err(ExchangeError::Rejected {
                code: "ValidationError".into(),
                message: format!("invalid role arn {}", request.role_arn),
            });
        }

        Ok(IssuedCredentials {
            access_key_id: format!("ASIASTATIC{:010}", call),
            secret_access_key: format!("static-secret-{}", call),
            session_token: format!("static-session-{}-{}", request.session_name, call),
            expiration: Utc::now() + *self.lifetime.read(),
        })
    }

    async fn caller_identity(&self, credentials: &ScopedCredentials) -> Result<CallerIdentity, ExchangeError> {
        self.identity_calls.fetch_add(1, Ordering::Relaxed);

        if let Some(identity) = self.identity_overrides.read().get(&credentials.role_arn) {
            return Ok(identity.clone());
        }
        let account = arn_account(&credentials.role_arn)
            .ok_or_else(|| ExchangeError::Malformed(format!("role arn {}", credentials.role_arn)))?;
        let role_name = credentials.role_arn.rsplit('/').next().unwrap_or_default();

        Ok(CallerIdentity {
            account: account.to_string(),
            arn: format!(
                "arn:aws:sts::{}:assumed-role/{}/{}",
                account, role_name, credentials.access_key_id
            ),
            user_id: format!("AROASTATIC:{}", credentials.access_key_id),
        })
    }
}
