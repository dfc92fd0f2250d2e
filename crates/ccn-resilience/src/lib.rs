//! Resilience Controller
//!
//! Wraps tenant-scoped operations with retry/backoff and a per-key circuit
//! breaker.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       RESILIENCE CONTROLLER                             │
//! │                                                                         │
//! │  execute_with_retry(shutdown, "acme:notification", op)                  │
//! │        │                                                                │
//! │  ┌─────▼─────────────────┐     ┌─────────────────────────────────────┐ │
//! │  │   BREAKER TABLE       │     │   RETRY LOOP                         │ │
//! │  │  Closed ─N fails─► Open│────►│  attempt ─► classify ─► backoff     │ │
//! │  │    ▲            cooldown│     │     ▲                       │       │ │
//! │  │    └── HalfOpen ◄──────┘│     │     └──── shutdown checked ─┘       │ │
//! │  └───────────────────────┘     └─────────────────────────────────────┘ │
//! │                                                                         │
//! │  counters: errors | trips | dead letters | retries | short circuits     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod policy;
pub mod breaker;
pub mod controller;

use ccn_common::{Classify, ErrorCategory};
use std::time::Duration;
use thiserror::Error;

pub use policy::{CircuitBreakerConfig, ResilienceConfig, RetryPolicy};
pub use breaker::{Admission, BreakerState, BreakerTable, CircuitBreakerState};
pub use controller::{ResilienceController, ResilienceMetrics};

/// Outcome of a guarded call that did not succeed
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + 'static,
{
    /// Breaker for `key` is open, the operation was not invoked
    #[error("circuit open for {key}, retry after {retry_after:?}")]
    CircuitOpen { key: String, retry_after: Duration },

    /// Shutdown requested between attempts
    #[error("cancelled {key} after {attempts} attempt(s)")]
    Cancelled { key: String, attempts: u32 },

    /// Operation failed and will not be retried further
    #[error("{key} failed after {attempts} attempt(s): {source}")]
    Failed {
        key: String,
        attempts: u32,
        #[source]
        source: E,
    },
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + 'static,
{
    /// Attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            Self::CircuitOpen { .. } => 0,
            Self::Cancelled { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }

    /// Underlying operation error, if the operation ran
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::Failed { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl<E> Classify for ResilienceError<E>
where
    E: Classify + std::error::Error + 'static,
{
    fn category(&self) -> ErrorCategory {
        match self {
            Self::CircuitOpen { .. } => ErrorCategory::CircuitOpen,
            Self::Cancelled { .. } => ErrorCategory::Cancelled,
            Self::Failed { source, .. } => source.category(),
        }
    }
}
