//! Credential errors

use ccn_common::{Classify, ErrorCategory, ServiceKind, TenantError};
use thiserror::Error;

use crate::exchange::ExchangeError;

/// Credential manager errors
#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    #[error("unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("unsupported service: {0}")]
    UnsupportedService(String),

    /// Exchange failed for a reason other than denial
    #[error("role assumption failed for {tenant}:{service}: {source}")]
    RoleAssumption {
        tenant: String,
        service: ServiceKind,
        #[source]
        source: ExchangeError,
    },

    /// Identity provider denied the request. Terminal for this attempt.
    #[error("role assumption denied for {tenant}:{service}: {message}")]
    Denied {
        tenant: String,
        service: ServiceKind,
        message: String,
    },

    /// Identity lookup failed transiently
    #[error("identity lookup failed for {tenant}: {source}")]
    IdentityLookup {
        tenant: String,
        #[source]
        source: ExchangeError,
    },

    #[error("credential validation failed for {tenant}: {reason}")]
    Validation { tenant: String, reason: String },

    #[error("{operation} timed out for {tenant}")]
    Timeout { tenant: String, operation: &'static str },
}

impl From<TenantError> for CredentialError {
    fn from(err: TenantError) -> Self {
        match err {
            TenantError::UnknownTenant(code) => Self::UnknownTenant(code),
            TenantError::UnsupportedService(name) => Self::UnsupportedService(name),
            other => Self::Validation {
                tenant: String::new(),
                reason: other.to_string(),
            },
        }
    }
}

impl Classify for CredentialError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownTenant(_) => ErrorCategory::UnknownTenant,
            Self::UnsupportedService(_) => ErrorCategory::Validation,
            Self::RoleAssumption { source, .. } => source.category(),
            Self::IdentityLookup { source, .. } => source.category(),
            Self::Denied { .. } => ErrorCategory::PermissionDenied,
            Self::Validation { .. } => ErrorCategory::Credentials,
            Self::Timeout { .. } => ErrorCategory::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assumption_failures_inherit_exchange_category() {
        let throttled = CredentialError::RoleAssumption {
            tenant: "acme".into(),
            service: ServiceKind::Queue,
            source: ExchangeError::Throttled("slow down".into()),
        };
        assert!(throttled.is_retryable());

        let denied = CredentialError::Denied {
            tenant: "acme".into(),
            service: ServiceKind::Queue,
            message: "not authorized".into(),
        };
        assert_eq!(denied.category(), ErrorCategory::PermissionDenied);
        assert!(!denied.is_retryable());
    }

    #[test]
    fn test_from_tenant_error() {
        let err: CredentialError = TenantError::UnknownTenant("initech".into()).into();
        assert!(matches!(err, CredentialError::UnknownTenant(code) if code == "initech"));
    }
}
