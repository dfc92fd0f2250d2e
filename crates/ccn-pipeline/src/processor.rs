//! Per-message processing
//!
//! ```text
//! Received ──parse/validate──► Validated ──start execution──► Processing
//!    │                             │                              │
//!    │ malformed / unknown tenant  │ duplicate change id          │ every tenant ok
//!    ▼                             ├─ settled: Acknowledged       ▼
//! DeadLettered                     └─ unsettled: resume ──►   Acknowledged
//!                                                                 │ any tenant failed
//!                                                                 ▼
//!                                                             DeadLettered
//! ```
//!
//! An execution is settled once its message has been deleted after success
//! or handed to the dead-letter queue. A redelivered change whose execution
//! is still unsettled re-runs the tenants that did not complete.

use ccn_common::tenant::cache_key;
use ccn_common::{Classify, ErrorCategory, MetricsSink, NoopSink, ShutdownSignal};
use ccn_credentials::{CredentialError, CredentialManager, CredentialMetrics};
use ccn_isolation::{IsolationMetrics, IsolationValidator};
use ccn_resilience::{ResilienceController, ResilienceError, ResilienceMetrics};
use ccn_tracker::{CustomerOutcome, Disposition, ExecutionTracker, StepStatus, TrackerError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::message::{ChangeMessage, DeadLetterEnvelope, MessageError};
use crate::operation::{OperationError, TenantOperation};
use crate::queue::{DeadLetterQueue, QueueClient, QueueMessage};

/// Collaborators the processor drives
#[derive(Clone)]
pub struct PipelineComponents {
    pub credentials: Arc<CredentialManager>,
    pub validator: Arc<IsolationValidator>,
    pub resilience: Arc<ResilienceController>,
    pub tracker: Arc<ExecutionTracker>,
    pub operation: Arc<dyn TenantOperation>,
    pub queue: Arc<dyn QueueClient>,
    pub dead_letter: Option<Arc<dyn DeadLetterQueue>>,
}

/// Failure of one tenant's operation
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    /// Resource belongs to another tenant and the policy forbids the access
    #[error("access to {resource} blocked: {reason}")]
    AccessBlocked { resource: String, reason: String },
}

impl Classify for ProcessingError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::Credentials(e) => e.category(),
            Self::Operation(e) => e.category(),
            Self::AccessBlocked { .. } => ErrorCategory::Validation,
        }
    }
}

/// Message lifecycle stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStage {
    Received,
    Validated,
    Processing,
    Acknowledged,
    DeadLettered,
}

impl fmt::Display for MessageStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::Processing => "processing",
            Self::Acknowledged => "acknowledged",
            Self::DeadLettered => "dead_lettered",
        };
        f.write_str(name)
    }
}

/// What happened to a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Every tenant succeeded, message deleted
    Acknowledged { execution: Uuid },
    /// Change id already settled, message deleted without touching the tracker
    Duplicate { execution: Uuid },
    /// Forwarded to the dead-letter queue and deleted
    DeadLettered { execution: Option<Uuid>, reason: String },
    /// Left on the queue; it becomes visible again after the visibility timeout
    Retained { execution: Option<Uuid>, reason: String },
}

impl MessageOutcome {
    pub fn stage(&self) -> Option<MessageStage> {
        match self {
            Self::Acknowledged { .. } | Self::Duplicate { .. } => Some(MessageStage::Acknowledged),
            Self::DeadLettered { .. } => Some(MessageStage::DeadLettered),
            Self::Retained { .. } => None,
        }
    }

    pub fn execution(&self) -> Option<Uuid> {
        match self {
            Self::Acknowledged { execution } | Self::Duplicate { execution } => Some(*execution),
            Self::DeadLettered { execution, .. } | Self::Retained { execution, .. } => *execution,
        }
    }
}

enum TenantResult {
    Succeeded,
    Failed(String),
    Cancelled,
}

/// Marks a change id as being processed until dropped
struct ActiveChange<'a> {
    active: &'a Mutex<HashSet<String>>,
    change_id: String,
}

impl<'a> ActiveChange<'a> {
    fn claim(active: &'a Mutex<HashSet<String>>, change_id: &str) -> Option<Self> {
        if !active.lock().insert(change_id.to_string()) {
            return None;
        }
        Some(Self {
            active,
            change_id: change_id.to_string(),
        })
    }
}

impl Drop for ActiveChange<'_> {
    fn drop(&mut self) {
        self.active.lock().remove(&self.change_id);
    }
}

#[derive(Debug, Default)]
pub(crate) struct PipelineStats {
    pub(crate) received: AtomicU64,
    pub(crate) acknowledged: AtomicU64,
    pub(crate) dead_lettered: AtomicU64,
    pub(crate) duplicates: AtomicU64,
    pub(crate) retained: AtomicU64,
    pub(crate) validation_failures: AtomicU64,
    pub(crate) tenant_failures: AtomicU64,
    pub(crate) delete_failures: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) receive_errors: AtomicU64,
    pub(crate) in_flight: AtomicU64,
}

/// Point-in-time pipeline counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineMetrics {
    pub running: bool,
    pub received: u64,
    pub acknowledged: u64,
    pub dead_lettered: u64,
    pub duplicates: u64,
    pub retained: u64,
    pub validation_failures: u64,
    pub tenant_failures: u64,
    pub delete_failures: u64,
    pub dropped: u64,
    pub receive_errors: u64,
    pub in_flight: u64,
    pub credentials: CredentialMetrics,
    pub resilience: ResilienceMetrics,
    pub isolation: IsolationMetrics,
}

/// Drives one message from receipt to acknowledgement or dead-letter
pub struct MessageProcessor {
    config: PipelineConfig,
    components: PipelineComponents,
    active: Mutex<HashSet<String>>,
    pub(crate) stats: PipelineStats,
    sink: Arc<dyn MetricsSink>,
}

impl MessageProcessor {
    pub fn new(config: PipelineConfig, components: PipelineComponents) -> Self {
        Self {
            config,
            components,
            active: Mutex::new(HashSet::new()),
            stats: PipelineStats::default(),
            sink: Arc::new(NoopSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn components(&self) -> &PipelineComponents {
        &self.components
    }

    pub(crate) fn sink(&self) -> &Arc<dyn MetricsSink> {
        &self.sink
    }

    /// Process one received message to its final disposition
    pub async fn process_message(&self, message: &QueueMessage, shutdown: &ShutdownSignal) -> MessageOutcome {
        let started = Instant::now();
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        self.stats.in_flight.fetch_add(1, Ordering::Relaxed);
        self.sink.increment("ccn_messages_received_total", &[], 1);
        debug!(
            message_id = %message.message_id,
            receive_count = message.receive_count,
            stage = %MessageStage::Received,
            "Message received"
        );

        let outcome = self.handle(message, shutdown).await;

        self.stats.in_flight.fetch_sub(1, Ordering::Relaxed);
        let label = match outcome.stage() {
            Some(stage) => stage.to_string(),
            None => "retained".to_string(),
        };
        self.sink.increment("ccn_messages_processed_total", &[("outcome", label.clone())], 1);
        self.sink.histogram(
            "ccn_message_processing_seconds",
            &[("outcome", label)],
            started.elapsed().as_secs_f64(),
        );
        outcome
    }

    async fn handle(&self, message: &QueueMessage, shutdown: &ShutdownSignal) -> MessageOutcome {
        let change = match self.admit(&message.body).await {
            Ok(change) => change,
            Err(e) => {
                self.stats.validation_failures.fetch_add(1, Ordering::Relaxed);
                warn!(message_id = %message.message_id, error = %e, "Message rejected");
                let tenant = match &e {
                    MessageError::IsolationViolation { tenant, .. } => Some(tenant.as_str()),
                    _ => None,
                };
                return self.dead_letter(message, None, tenant, &e.to_string()).await;
            }
        };
        debug!(
            message_id = %message.message_id,
            change_id = %change.change_id,
            stage = %MessageStage::Validated,
            "Message validated"
        );

        let tracker = &self.components.tracker;
        let Some(_active) = ActiveChange::claim(&self.active, &change.change_id) else {
            self.stats.retained.fetch_add(1, Ordering::Relaxed);
            info!(
                message_id = %message.message_id,
                change_id = %change.change_id,
                "Change already in progress, leaving redelivery on the queue"
            );
            return MessageOutcome::Retained {
                execution: tracker.find_by_change_id(&change.change_id).map(|e| e.id),
                reason: "change already in progress".into(),
            };
        };

        let (execution, tenants) = match tracker.start_execution(
            &change.change_id,
            &change.title,
            &change.description,
            change.initiator(),
            &change.customer_codes,
        ) {
            Ok(id) => (id, change.customer_codes.clone()),
            Err(TrackerError::DuplicateChange { existing, .. }) => match tracker.resume_execution(existing) {
                Ok(pending) => {
                    info!(
                        message_id = %message.message_id,
                        change_id = %change.change_id,
                        execution = %existing,
                        tenants = pending.len(),
                        "Redelivered change was never settled, resuming"
                    );
                    let tenants: Vec<String> = change
                        .customer_codes
                        .iter()
                        .filter(|code| pending.contains(*code))
                        .cloned()
                        .collect();
                    (existing, tenants)
                }
                Err(TrackerError::AlreadySettled { disposition, .. }) => {
                    self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                    self.sink.increment("ccn_messages_duplicate_total", &[], 1);
                    info!(
                        message_id = %message.message_id,
                        change_id = %change.change_id,
                        execution = %existing,
                        disposition = %disposition,
                        "Duplicate change, acknowledging redelivery"
                    );
                    self.delete(message).await;
                    return MessageOutcome::Duplicate { execution: existing };
                }
                Err(e) => {
                    return self.dead_letter(message, Some(existing), None, &e.to_string()).await;
                }
            },
            Err(e) => {
                self.stats.validation_failures.fetch_add(1, Ordering::Relaxed);
                return self.dead_letter(message, None, None, &e.to_string()).await;
            }
        };

        debug!(execution = %execution, stage = %MessageStage::Processing, "Processing tenants");
        let mut failures: Vec<(String, String)> = Vec::new();
        let mut cancelled = false;
        for tenant in &tenants {
            match self.run_tenant(execution, &change, tenant, shutdown).await {
                TenantResult::Succeeded => {}
                TenantResult::Failed(reason) => failures.push((tenant.clone(), reason)),
                TenantResult::Cancelled => cancelled = true,
            }
        }

        if cancelled {
            self.stats.retained.fetch_add(1, Ordering::Relaxed);
            warn!(
                message_id = %message.message_id,
                execution = %execution,
                "Shutdown interrupted message, leaving it on the queue"
            );
            return MessageOutcome::Retained {
                execution: Some(execution),
                reason: "shutdown requested before all tenants ran".into(),
            };
        }

        if failures.is_empty() {
            self.settle(execution, Disposition::Acknowledged);
            if !self.delete(message).await {
                self.stats.retained.fetch_add(1, Ordering::Relaxed);
                return MessageOutcome::Retained {
                    execution: Some(execution),
                    reason: "delete failed after success".into(),
                };
            }
            self.stats.acknowledged.fetch_add(1, Ordering::Relaxed);
            info!(
                message_id = %message.message_id,
                change_id = %change.change_id,
                execution = %execution,
                tenants = change.customer_codes.len(),
                "Message acknowledged"
            );
            return MessageOutcome::Acknowledged { execution };
        }

        let reason = failures
            .iter()
            .map(|(tenant, error)| format!("{}: {}", tenant, error))
            .collect::<Vec<_>>()
            .join("; ");
        let first_failed = failures.first().map(|(tenant, _)| tenant.as_str());
        self.dead_letter(message, Some(execution), first_failed, &reason).await
    }

    /// Parse, validate and run the isolation gate
    async fn admit(&self, body: &str) -> Result<ChangeMessage, MessageError> {
        let change = ChangeMessage::parse(body)?;
        change.validate(self.components.credentials.registry())?;

        if self.config.enforce_isolation {
            for tenant in &change.customer_codes {
                let report = self
                    .components
                    .validator
                    .validate_tenant(tenant)
                    .await
                    .map_err(|e| MessageError::IsolationViolation {
                        tenant: tenant.clone(),
                        rules: e.to_string(),
                    })?;
                let blocking = report.blocking_failures();
                if !blocking.is_empty() {
                    let rules = blocking
                        .iter()
                        .map(|result| result.rule_id.as_str())
                        .collect::<Vec<_>>()
                        .join(",");
                    return Err(MessageError::IsolationViolation {
                        tenant: tenant.clone(),
                        rules,
                    });
                }
            }
        }
        Ok(change)
    }

    async fn run_tenant(
        &self,
        execution: Uuid,
        change: &ChangeMessage,
        tenant: &str,
        shutdown: &ShutdownSignal,
    ) -> TenantResult {
        let tracker = &self.components.tracker;
        let operation = self.components.operation.as_ref();
        let credentials = self.components.credentials.as_ref();
        let validator = self.components.validator.as_ref();
        let service = operation.service();

        if let Err(e) = tracker.start_customer_execution(execution, tenant) {
            warn!(execution = %execution, tenant = %tenant, error = %e, "Tracker rejected customer start");
        }
        let step = tracker
            .add_step(
                execution,
                tenant,
                operation.name(),
                &format!("{} under the {} role", operation.name(), service),
            )
            .ok();
        if let Some(step) = &step {
            let _ = tracker.update_step(execution, tenant, step, StepStatus::Running, None);
        }

        let key = cache_key(tenant, service);
        let result = self
            .components
            .resilience
            .execute_with_retry(shutdown, &key, move || async move {
                let scope = credentials.scoped_config(tenant, service).await?;
                for (access, resource) in operation.resources(&scope.tenant) {
                    let attempt = validator.check_resource_access(tenant, access, resource);
                    if attempt.blocked {
                        return Err(ProcessingError::AccessBlocked {
                            resource: resource.to_string(),
                            reason: attempt.reason,
                        });
                    }
                }
                let reference = operation.execute(change, &scope).await?;
                Ok::<Option<String>, ProcessingError>(reference)
            })
            .await;

        let mut reference = None;
        let (outcome, step_status, step_error, result) = match result {
            Ok(returned) => {
                reference = returned;
                (
                    CustomerOutcome::Succeeded,
                    StepStatus::Completed,
                    None,
                    TenantResult::Succeeded,
                )
            }
            Err(ResilienceError::Cancelled { attempts, .. }) => {
                let message = format!("cancelled by shutdown after {} attempt(s)", attempts);
                (
                    CustomerOutcome::Failed {
                        category: ErrorCategory::Cancelled,
                        message: message.clone(),
                    },
                    StepStatus::Failed,
                    Some(message),
                    TenantResult::Cancelled,
                )
            }
            Err(e) => {
                let message = e.to_string();
                self.stats.tenant_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    execution = %execution,
                    tenant = %tenant,
                    category = %e.category(),
                    attempts = e.attempts(),
                    error = %message,
                    "Tenant operation failed"
                );
                (
                    CustomerOutcome::Failed {
                        category: e.category(),
                        message: message.clone(),
                    },
                    StepStatus::Failed,
                    Some(message.clone()),
                    TenantResult::Failed(message),
                )
            }
        };

        if let (Some(step), Some(reference)) = (&step, &reference) {
            let _ = tracker.record_step_reference(execution, tenant, step, reference);
        }
        if let Some(step) = &step {
            let _ = tracker.update_step(execution, tenant, step, step_status, step_error);
        }
        if let Err(e) = tracker.complete_customer_execution(execution, tenant, outcome) {
            warn!(execution = %execution, tenant = %tenant, error = %e, "Tracker rejected customer completion");
        }
        result
    }

    /// Forward to the dead-letter queue, settle the execution, then delete
    /// the original.
    ///
    /// Without a dead-letter queue, or when the hand-off fails, the message
    /// stays on the primary queue and the execution stays unsettled.
    async fn dead_letter(
        &self,
        message: &QueueMessage,
        execution: Option<Uuid>,
        tenant: Option<&str>,
        reason: &str,
    ) -> MessageOutcome {
        let Some(dead_letter) = &self.components.dead_letter else {
            self.stats.retained.fetch_add(1, Ordering::Relaxed);
            error!(
                message_id = %message.message_id,
                error = %reason,
                "No dead-letter queue configured, leaving message on the queue"
            );
            return MessageOutcome::Retained {
                execution,
                reason: reason.to_string(),
            };
        };

        let envelope = DeadLetterEnvelope::new(&message.body, reason, &self.config.processor_name);
        let sent = match envelope.to_json() {
            Ok(body) => dead_letter.send(&body).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = sent {
            self.stats.retained.fetch_add(1, Ordering::Relaxed);
            error!(message_id = %message.message_id, error = %e, "Dead-letter hand-off failed");
            return MessageOutcome::Retained {
                execution,
                reason: format!("dead-letter hand-off failed: {}", e),
            };
        }

        if let Some(id) = execution {
            self.settle(id, Disposition::DeadLettered);
        }
        self.components.resilience.record_dead_letter(tenant);
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        error!(
            message_id = %message.message_id,
            execution = ?execution,
            error = %reason,
            "Message dead-lettered"
        );
        self.delete(message).await;
        MessageOutcome::DeadLettered {
            execution,
            reason: reason.to_string(),
        }
    }

    fn settle(&self, execution: Uuid, disposition: Disposition) {
        if let Err(e) = self.components.tracker.settle_execution(execution, disposition) {
            warn!(execution = %execution, error = %e, "Tracker rejected settlement");
        }
    }

    async fn delete(&self, message: &QueueMessage) -> bool {
        match self.components.queue.delete(&message.receipt_handle).await {
            Ok(()) => true,
            Err(e) => {
                self.stats.delete_failures.fetch_add(1, Ordering::Relaxed);
                self.sink.increment("ccn_queue_delete_failures_total", &[], 1);
                warn!(message_id = %message.message_id, error = %e, "Failed to delete message");
                false
            }
        }
    }

    /// Counter snapshot; `running` is filled in by the pipeline
    pub fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            running: false,
            received: self.stats.received.load(Ordering::Relaxed),
            acknowledged: self.stats.acknowledged.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            retained: self.stats.retained.load(Ordering::Relaxed),
            validation_failures: self.stats.validation_failures.load(Ordering::Relaxed),
            tenant_failures: self.stats.tenant_failures.load(Ordering::Relaxed),
            delete_failures: self.stats.delete_failures.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            receive_errors: self.stats.receive_errors.load(Ordering::Relaxed),
            in_flight: self.stats.in_flight.load(Ordering::Relaxed),
            credentials: self.components.credentials.metrics(),
            resilience: self.components.resilience.metrics(),
            isolation: self.components.validator.metrics(),
        }
    }
}
