//! CCN Common - shared building blocks for the change notification core
//!
//! Every other crate in the workspace depends on this one for:
//! - The tenant registry (read-only after load)
//! - Error categories used for retry classification and error summaries
//! - The metrics sink collaborator
//! - The shutdown signal shared through the call graph
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     CHANGE NOTIFICATION CORE                            │
//! │                                                                         │
//! │   queue ──► Pipeline worker ──► Validator / Credential Manager          │
//! │                  │                                                      │
//! │                  ▼                                                      │
//! │        Resilience Controller ──► tenant operation                       │
//! │                  │                                                      │
//! │                  ▼                                                      │
//! │        Execution Tracker ──► ack / dead-letter                          │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  ccn-common: TenantRegistry | ErrorCategory | MetricsSink |      │  │
//! │  │              ShutdownSignal | serde helpers                       │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod tenant;
pub mod error;
pub mod metrics;
pub mod shutdown;
pub mod serde_helpers;

pub use tenant::{ServiceKind, ServiceRoles, TenantAccount, TenantRegistry, TenantResources};
pub use error::{Classify, ErrorCategory, TenantError};
pub use metrics::{FacadeSink, MetricsSink, NoopSink, RecordingSink};
pub use shutdown::ShutdownSignal;
