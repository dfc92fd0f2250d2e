//! CCN Pipeline - message ingestion for the change notification core
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                       MESSAGE INGESTION PIPELINE                     │
//! │                                                                      │
//! │  QueueClient ──► Poller ──► bounded buffer ──► Worker × N            │
//! │  (SQS / mem)      │  full: drop + warn            │                  │
//! │                   │                               ▼                  │
//! │                   │               MessageProcessor                   │
//! │                   │        parse ─ validate ─ isolation gate         │
//! │                   │                   │                              │
//! │                   │        ExecutionTracker.start_execution          │
//! │                   │                   │                              │
//! │                   │   per tenant: ResilienceController               │
//! │                   │      └─ CredentialManager.scoped_config          │
//! │                   │      └─ TenantOperation.execute                  │
//! │                   │                   │                              │
//! │                   │        delete ◄───┴───► DeadLetterQueue + delete │
//! │                                                                      │
//! │  Metrics reporter ── MetricsSink          ShutdownSignal ── all tasks│
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod message;
pub mod operation;
pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod sqs;

use ccn_common::{Classify, ErrorCategory};
use std::time::Duration;
use thiserror::Error;

pub use config::{ConfigError, PipelineConfig, ServiceConfig};
pub use message::{ChangeMessage, DeadLetterEnvelope, MessageError, Priority};
pub use operation::{
    Notification, NotificationOperation, NotificationSender, OperationError, RecordingSender,
    SqsNotificationSender, TenantOperation,
};
pub use pipeline::Pipeline;
pub use processor::{
    MessageOutcome, MessageProcessor, MessageStage, PipelineComponents, PipelineMetrics,
    ProcessingError,
};
pub use queue::{
    DeadLetterQueue, InMemoryDeadLetterQueue, InMemoryQueue, QueueClient, QueueError, QueueMessage,
};
pub use sqs::{SqsDeadLetterQueue, SqsQueue};

/// Pipeline lifecycle errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline already running")]
    AlreadyRunning,

    #[error("pipeline has been shut down")]
    Stopped,

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Queue unreachable at startup
    #[error("queue connectivity check failed: {0}")]
    Queue(#[from] QueueError),

    /// Workers still running at the deadline. In-flight state is left as is.
    #[error("shutdown timed out after {timeout:?} with {pending} task(s) still running")]
    ShutdownTimeout { timeout: Duration, pending: usize },
}

impl Classify for PipelineError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::AlreadyRunning | Self::Stopped | Self::Config(_) => ErrorCategory::Validation,
            Self::Queue(e) => e.category(),
            Self::ShutdownTimeout { .. } => ErrorCategory::Timeout,
        }
    }
}
