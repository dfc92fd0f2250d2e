//! Error types and classification shared across the core

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Tenant registry errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TenantError {
    /// Tenant code is not registered
    #[error("unknown tenant: {0}")]
    UnknownTenant(String),

    /// Tenant definition failed validation
    #[error("invalid tenant {code}: {reason}")]
    InvalidTenant { code: String, reason: String },

    /// Tenant code registered twice
    #[error("duplicate tenant: {0}")]
    DuplicateTenant(String),

    /// Service name is not one of notification/queue/storage
    #[error("unsupported service: {0}")]
    UnsupportedService(String),

    /// Registry source could not be read or parsed
    #[error("tenant registry load error: {0}")]
    Load(String),
}

/// Error category. Drives retry decisions and error summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed input or failed validation
    Validation,
    /// Tenant not in the registry
    UnknownTenant,
    /// Credentials missing, expired or invalid
    Credentials,
    /// Identity provider or service denied the request
    PermissionDenied,
    /// Rate limited by a dependency
    Throttling,
    /// Dependency did not answer in time
    Timeout,
    /// Transient transport failure
    Network,
    /// Circuit breaker rejected the call
    CircuitOpen,
    /// Shutdown requested
    Cancelled,
    /// Anything else
    Internal,
}

impl ErrorCategory {
    /// Whether an operation failing with this category may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttling | Self::Timeout | Self::Network)
    }

    /// Whether a failure of this category counts toward a circuit breaker
    pub fn trips_breaker(&self) -> bool {
        !matches!(
            self,
            Self::Validation | Self::UnknownTenant | Self::CircuitOpen | Self::Cancelled
        )
    }

    /// Stable label for metrics and summaries
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::UnknownTenant => "unknown_tenant",
            Self::Credentials => "credentials",
            Self::PermissionDenied => "permission_denied",
            Self::Throttling => "throttling",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::CircuitOpen => "circuit_open",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that know their own category
pub trait Classify {
    /// Category of this error
    fn category(&self) -> ErrorCategory;

    /// Retry decision, derived from the category by default
    fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

impl Classify for TenantError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownTenant(_) => ErrorCategory::UnknownTenant,
            Self::InvalidTenant { .. } | Self::UnsupportedService(_) | Self::DuplicateTenant(_) => {
                ErrorCategory::Validation
            }
            Self::Load(_) => ErrorCategory::Internal,
        }
    }
}
