//! Credential Isolation Manager
//!
//! Assumes a distinct role per (tenant, service) pair, caches the resulting
//! short-lived credentials and hands validated, scoped configuration to
//! callers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    CREDENTIAL ISOLATION MANAGER                         │
//! │                                                                         │
//! │   get_cached_or_assume(tenant, service)                                 │
//! │        │                                                                │
//! │  ┌─────▼──────────────────────────────────────────────────────────┐    │
//! │  │  CREDENTIAL CACHE   (sharded map, one async lock per key)       │    │
//! │  │   acme:notification │ acme:queue │ globex:notification │ ...    │    │
//! │  └─────┬──────────────────────────────────────────────────────────┘    │
//! │        │ miss / inside safety margin                                    │
//! │  ┌─────▼──────────────────────────────────────────────────────────┐    │
//! │  │  IDENTITY EXCHANGE   (STS AssumeRole / GetCallerIdentity)       │    │
//! │  └────────────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Eviction is lazy: an entry is checked on read and refreshed when its
//! remaining lifetime is inside the safety margin. There is no sweeper task.

pub mod model;
pub mod error;
pub mod exchange;
pub mod sts;
pub mod cache;
pub mod manager;

use ccn_common::serde_helpers::duration_secs;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use model::{CallerIdentity, CredentialValidation, ScopedClientConfig, ScopedCredentials, ValidationMode};
pub use error::CredentialError;
pub use exchange::{AssumeRoleRequest, ExchangeError, IdentityExchange, IssuedCredentials, StaticExchange};
pub use sts::StsExchange;
pub use cache::{CacheEntryStatus, CredentialCache, CredentialCacheEntry};
pub use manager::{CredentialManager, CredentialMetrics};

/// Credential manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Cached credentials closer than this to expiry are refreshed
    #[serde(with = "duration_secs")]
    pub safety_margin: Duration,
    /// Requested session lifetime
    #[serde(with = "duration_secs")]
    pub session_duration: Duration,
    /// Upper bound on any identity exchange call
    #[serde(with = "duration_secs")]
    pub assume_timeout: Duration,
    /// Resolve caller identity once after every fresh assumption
    pub verify_identity: bool,
    /// Role session name prefix
    pub session_name_prefix: String,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(300),
            session_duration: Duration::from_secs(3600),
            assume_timeout: Duration::from_secs(10),
            verify_identity: true,
            session_name_prefix: "ccn".into(),
        }
    }
}
