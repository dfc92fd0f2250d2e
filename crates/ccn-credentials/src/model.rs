//! Credential Data Model

use ccn_common::{ServiceKind, TenantAccount};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Short-lived credentials scoped to one tenant and one service role
#[derive(Clone, Serialize)]
pub struct ScopedCredentials {
    pub access_key_id: String,
    #[serde(skip)]
    secret_access_key: String,
    #[serde(skip)]
    session_token: String,
    pub expiration: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub tenant_code: String,
    pub role_arn: String,
    pub service: ServiceKind,
    pub region: String,
}

impl ScopedCredentials {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        access_key_id: String,
        secret_access_key: String,
        session_token: String,
        expiration: DateTime<Utc>,
        tenant_code: &str,
        role_arn: &str,
        service: ServiceKind,
        region: &str,
    ) -> Self {
        Self {
            access_key_id,
            secret_access_key,
            session_token,
            expiration,
            issued_at: Utc::now(),
            tenant_code: tenant_code.to_string(),
            role_arn: role_arn.to_string(),
            service,
            region: region.to_string(),
        }
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    /// Remaining lifetime at `now`, zero once expired
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expiration - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }

    /// Usable at `now`: remaining lifetime strictly exceeds the margin
    pub fn is_usable_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        !self.is_expired_at(now) && self.remaining_at(now) > margin
    }

    /// Account id embedded in the role ARN
    pub fn role_account(&self) -> Option<&str> {
        arn_account(&self.role_arn)
    }
}

impl fmt::Debug for ScopedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expiration", &self.expiration)
            .field("tenant_code", &self.tenant_code)
            .field("role_arn", &self.role_arn)
            .field("service", &self.service)
            .field("region", &self.region)
            .finish()
    }
}

/// Account id segment of an ARN (`arn:partition:service:region:account:resource`)
pub fn arn_account(arn: &str) -> Option<&str> {
    let mut parts = arn.splitn(6, ':');
    if parts.next()? != "arn" {
        return None;
    }
    let account = parts.nth(3)?;
    parts.next()?;
    if account.is_empty() {
        None
    } else {
        Some(account)
    }
}

/// Identity a set of credentials resolves to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub account: String,
    pub arn: String,
    pub user_id: String,
}

/// How thoroughly to validate credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Expiry plus identity resolution against the identity service
    Full,
    /// Expiry only, no network call
    ExpiryOnly,
}

/// Result of a credential validation
#[derive(Debug, Clone, Serialize)]
pub struct CredentialValidation {
    pub tenant_code: String,
    pub role_arn: String,
    pub mode: ValidationMode,
    pub identity: Option<CallerIdentity>,
    pub remaining_secs: u64,
    pub checked_at: DateTime<Utc>,
}

/// Validated configuration handed to tenant operations
#[derive(Debug, Clone)]
pub struct ScopedClientConfig {
    pub tenant: Arc<TenantAccount>,
    pub service: ServiceKind,
    pub credentials: ScopedCredentials,
    pub region: String,
}
