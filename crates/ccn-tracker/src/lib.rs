//! Execution Status Tracker
//!
//! Hierarchical state for change-notification runs:
//!
//! ```text
//! Execution (Pending → Running → Completed | Failed | Partial)
//!   └── CustomerStatus per tenant (Pending → Running → Completed | Failed)
//!         └── Step, appended as work is performed
//! ```
//!
//! State is held in process. Each execution sits behind its own mutex so the
//! "every tenant terminal ⇒ derive overall status" transition is atomic.

pub mod model;
pub mod tracker;
pub mod summary;

use ccn_common::{Classify, ErrorCategory};
use thiserror::Error;
use uuid::Uuid;

pub use model::{
    CustomerOutcome, CustomerState, CustomerStatus, Disposition, ErrorSummary, Execution,
    ExecutionMetrics, ExecutionStatus, Step, StepStatus,
};
pub use tracker::ExecutionTracker;
pub use summary::{ExecutionFilter, ExecutionSummary, PerformanceStats, TenantStats};

/// Tracker errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("execution requires at least one tenant")]
    NoTenants,

    /// Change id already has an execution. Never overwritten.
    #[error("change {change_id} already tracked by execution {existing}")]
    DuplicateChange { change_id: String, existing: Uuid },

    #[error("tenant {tenant} is not part of execution {execution}")]
    TenantNotInExecution { execution: Uuid, tenant: String },

    #[error("step {step} not found for tenant {tenant}")]
    StepNotFound { tenant: String, step: String },

    /// Message behind the execution was already acknowledged or dead-lettered
    #[error("execution {execution} already settled as {disposition}")]
    AlreadySettled { execution: Uuid, disposition: Disposition },

    #[error("invalid transition for {subject}: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: String,
        to: String,
    },
}

impl Classify for TrackerError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownTenant(_) => ErrorCategory::UnknownTenant,
            Self::NoTenants | Self::DuplicateChange { .. } | Self::AlreadySettled { .. } => {
                ErrorCategory::Validation
            }
            _ => ErrorCategory::Internal,
        }
    }
}
