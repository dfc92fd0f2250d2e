//! Execution tracker

use ccn_common::{MetricsSink, NoopSink, TenantRegistry};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{
    millis_between, CustomerOutcome, CustomerState, CustomerStatus, Disposition, Execution,
    ExecutionStatus, Step, StepStatus,
};
use crate::summary::{ExecutionFilter, ExecutionSummary};
use crate::TrackerError;

type Result<T> = std::result::Result<T, TrackerError>;

#[derive(Debug, Default)]
struct TrackerStats {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    partial: AtomicU64,
    duplicates: AtomicU64,
    resumed: AtomicU64,
}

/// In-process execution/customer/step tracker
pub struct ExecutionTracker {
    registry: Arc<TenantRegistry>,
    executions: DashMap<Uuid, Arc<Mutex<Execution>>>,
    by_change_id: DashMap<String, Uuid>,
    stats: TrackerStats,
    sink: Arc<dyn MetricsSink>,
}

impl ExecutionTracker {
    pub fn new(registry: Arc<TenantRegistry>) -> Self {
        Self {
            registry,
            executions: DashMap::new(),
            by_change_id: DashMap::new(),
            stats: TrackerStats::default(),
            sink: Arc::new(NoopSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    fn handle(&self, id: Uuid) -> Result<Arc<Mutex<Execution>>> {
        self.executions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(TrackerError::ExecutionNotFound(id))
    }

    /// Register a new execution with every tenant pending.
    ///
    /// A change id maps to at most one execution; a second start for the
    /// same change id fails with [`TrackerError::DuplicateChange`].
    pub fn start_execution(
        &self,
        change_id: &str,
        title: &str,
        description: &str,
        initiator: &str,
        tenant_codes: &[String],
    ) -> Result<Uuid> {
        if tenant_codes.is_empty() {
            return Err(TrackerError::NoTenants);
        }
        if let Some(unknown) = tenant_codes.iter().find(|code| !self.registry.contains(code)) {
            return Err(TrackerError::UnknownTenant(unknown.clone()));
        }

        let id = match self.by_change_id.entry(change_id.to_string()) {
            Entry::Occupied(existing) => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                return Err(TrackerError::DuplicateChange {
                    change_id: change_id.to_string(),
                    existing: *existing.get(),
                });
            }
            Entry::Vacant(slot) => {
                let id = Uuid::new_v4();
                let customers = tenant_codes
                    .iter()
                    .map(|code| (code.clone(), CustomerStatus::pending(code)))
                    .collect();
                let execution = Execution {
                    id,
                    change_id: change_id.to_string(),
                    title: title.to_string(),
                    description: description.to_string(),
                    initiator: initiator.to_string(),
                    status: ExecutionStatus::Pending,
                    customers,
                    created_at: Utc::now(),
                    started_at: None,
                    completed_at: None,
                    duration_ms: None,
                    metrics: None,
                    error_summary: None,
                    disposition: None,
                };
                // Index and execution are inserted while the index shard is held
                self.executions.insert(id, Arc::new(Mutex::new(execution)));
                slot.insert(id);
                id
            }
        };

        self.stats.started.fetch_add(1, Ordering::Relaxed);
        self.sink.increment("ccn_executions_started_total", &[], 1);
        info!(
            execution = %id,
            change_id = %change_id,
            tenants = tenant_codes.len(),
            "Execution started"
        );
        Ok(id)
    }

    /// Move a tenant from Pending to Running
    pub fn start_customer_execution(&self, id: Uuid, tenant: &str) -> Result<()> {
        let handle = self.handle(id)?;
        let mut execution = handle.lock();
        let now = Utc::now();

        let customer = execution
            .customers
            .get_mut(tenant)
            .ok_or_else(|| TrackerError::TenantNotInExecution {
                execution: id,
                tenant: tenant.to_string(),
            })?;
        if customer.status != CustomerState::Pending {
            return Err(TrackerError::InvalidTransition {
                subject: format!("customer {}", tenant),
                from: customer.status.to_string(),
                to: CustomerState::Running.to_string(),
            });
        }
        customer.status = CustomerState::Running;
        customer.started_at = Some(now);

        if execution.status == ExecutionStatus::Pending {
            execution.status = ExecutionStatus::Running;
            execution.started_at = Some(now);
        }
        debug!(execution = %id, tenant = %tenant, "Customer execution started");
        Ok(())
    }

    /// Append a pending step to a tenant's run and return its id
    pub fn add_step(&self, id: Uuid, tenant: &str, name: &str, description: &str) -> Result<String> {
        let handle = self.handle(id)?;
        let mut execution = handle.lock();
        let customer = execution
            .customers
            .get_mut(tenant)
            .ok_or_else(|| TrackerError::TenantNotInExecution {
                execution: id,
                tenant: tenant.to_string(),
            })?;
        if customer.status.is_terminal() {
            return Err(TrackerError::InvalidTransition {
                subject: format!("customer {}", tenant),
                from: customer.status.to_string(),
                to: "add_step".to_string(),
            });
        }

        let step_id = format!("step-{}", customer.steps.len() + 1);
        customer.steps.push(Step::new(step_id.clone(), name, description));
        Ok(step_id)
    }

    /// Change a step's status.
    ///
    /// Entering Running stamps `started_at`; entering a terminal state
    /// stamps `completed_at` and sets `duration_ms` to their difference.
    /// Terminal steps cannot change again.
    pub fn update_step(
        &self,
        id: Uuid,
        tenant: &str,
        step_id: &str,
        status: StepStatus,
        error: Option<String>,
    ) -> Result<()> {
        let handle = self.handle(id)?;
        let mut execution = handle.lock();
        let customer = execution
            .customers
            .get_mut(tenant)
            .ok_or_else(|| TrackerError::TenantNotInExecution {
                execution: id,
                tenant: tenant.to_string(),
            })?;
        let step = customer
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| TrackerError::StepNotFound {
                tenant: tenant.to_string(),
                step: step_id.to_string(),
            })?;

        if step.status.is_terminal() || (status == StepStatus::Pending && step.status != StepStatus::Pending) {
            return Err(TrackerError::InvalidTransition {
                subject: format!("step {}", step_id),
                from: step.status.to_string(),
                to: status.to_string(),
            });
        }

        let now = Utc::now();
        match status {
            StepStatus::Pending => {}
            StepStatus::Running => {
                step.started_at = Some(now);
            }
            StepStatus::Completed | StepStatus::Failed => {
                let started = *step.started_at.get_or_insert(now);
                step.completed_at = Some(now);
                step.duration_ms = Some(millis_between(started, now));
            }
        }
        step.status = status;
        if error.is_some() {
            step.error = error;
        }
        Ok(())
    }

    /// Record a tenant's outcome.
    ///
    /// When this was the last non-terminal tenant the overall status is
    /// derived, metrics and the error summary computed, all under the
    /// execution's lock. Returns the execution status after the update.
    pub fn complete_customer_execution(
        &self,
        id: Uuid,
        tenant: &str,
        outcome: CustomerOutcome,
    ) -> Result<ExecutionStatus> {
        let handle = self.handle(id)?;
        let mut execution = handle.lock();
        let now = Utc::now();

        let customer = execution
            .customers
            .get_mut(tenant)
            .ok_or_else(|| TrackerError::TenantNotInExecution {
                execution: id,
                tenant: tenant.to_string(),
            })?;
        let target = match outcome {
            CustomerOutcome::Succeeded => CustomerState::Completed,
            CustomerOutcome::Failed { .. } => CustomerState::Failed,
        };
        if customer.status.is_terminal() {
            return Err(TrackerError::InvalidTransition {
                subject: format!("customer {}", tenant),
                from: customer.status.to_string(),
                to: target.to_string(),
            });
        }

        let started = *customer.started_at.get_or_insert(now);
        customer.status = target;
        customer.completed_at = Some(now);
        customer.duration_ms = Some(millis_between(started, now));
        if let CustomerOutcome::Failed { category, message } = outcome {
            warn!(execution = %id, tenant = %tenant, category = %category, error = %message, "Customer execution failed");
            customer.error = Some(message);
            customer.error_category = Some(category);
        }

        if execution.started_at.is_none() {
            execution.started_at = Some(started);
        }
        if execution.status == ExecutionStatus::Pending {
            execution.status = ExecutionStatus::Running;
        }

        if execution.all_customers_terminal() {
            self.finalize(&mut execution);
        }
        Ok(execution.status)
    }

    /// Attach the downstream identifier of a step's work
    pub fn record_step_reference(&self, id: Uuid, tenant: &str, step_id: &str, reference: &str) -> Result<()> {
        let handle = self.handle(id)?;
        let mut execution = handle.lock();
        let customer = execution
            .customers
            .get_mut(tenant)
            .ok_or_else(|| TrackerError::TenantNotInExecution {
                execution: id,
                tenant: tenant.to_string(),
            })?;
        let step = customer
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| TrackerError::StepNotFound {
                tenant: tenant.to_string(),
                step: step_id.to_string(),
            })?;
        step.reference = Some(reference.to_string());
        Ok(())
    }

    /// Record that the execution's message was deleted or dead-lettered.
    /// Settling twice fails with [`TrackerError::AlreadySettled`].
    pub fn settle_execution(&self, id: Uuid, disposition: Disposition) -> Result<()> {
        let handle = self.handle(id)?;
        let mut execution = handle.lock();
        if let Some(existing) = execution.disposition {
            return Err(TrackerError::AlreadySettled {
                execution: id,
                disposition: existing,
            });
        }
        execution.disposition = Some(disposition);
        debug!(execution = %id, disposition = %disposition, "Execution settled");
        Ok(())
    }

    /// Reopen an unsettled execution for a redelivered message.
    ///
    /// Every tenant that did not complete goes back to Pending with its
    /// steps kept, and a finished execution returns to Running. Returns the
    /// tenants to run again, in tenant order.
    pub fn resume_execution(&self, id: Uuid) -> Result<Vec<String>> {
        let handle = self.handle(id)?;
        let mut execution = handle.lock();
        if let Some(disposition) = execution.disposition {
            return Err(TrackerError::AlreadySettled {
                execution: id,
                disposition,
            });
        }

        let mut pending = Vec::new();
        for customer in execution.customers.values_mut() {
            if customer.status == CustomerState::Completed {
                continue;
            }
            customer.status = CustomerState::Pending;
            customer.started_at = None;
            customer.completed_at = None;
            customer.duration_ms = None;
            customer.error = None;
            customer.error_category = None;
            pending.push(customer.tenant_code.clone());
        }

        if execution.status.is_terminal() && !pending.is_empty() {
            execution.status = ExecutionStatus::Running;
            execution.completed_at = None;
            execution.duration_ms = None;
            execution.metrics = None;
            execution.error_summary = None;
        }

        self.stats.resumed.fetch_add(1, Ordering::Relaxed);
        self.sink.increment("ccn_executions_resumed_total", &[], 1);
        info!(
            execution = %id,
            change_id = %execution.change_id,
            tenants = pending.len(),
            "Execution resumed"
        );
        Ok(pending)
    }

    fn finalize(&self, execution: &mut Execution) {
        let now = Utc::now();
        let started = execution.started_at.unwrap_or(execution.created_at);
        let duration_ms = millis_between(started, now);

        execution.status = execution.derive_status();
        execution.completed_at = Some(now);
        execution.duration_ms = Some(duration_ms);
        execution.metrics = Some(execution.compute_metrics(duration_ms));
        execution.error_summary = execution.compute_error_summary();

        let counter = match execution.status {
            ExecutionStatus::Completed => &self.stats.completed,
            ExecutionStatus::Failed => &self.stats.failed,
            _ => &self.stats.partial,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.sink.increment(
            "ccn_executions_completed_total",
            &[("status", execution.status.to_string())],
            1,
        );
        self.sink.histogram(
            "ccn_execution_duration_seconds",
            &[],
            duration_ms as f64 / 1000.0,
        );
        info!(
            execution = %execution.id,
            change_id = %execution.change_id,
            status = %execution.status,
            duration_ms,
            "Execution finished"
        );
    }

    pub fn get_execution(&self, id: Uuid) -> Result<Execution> {
        Ok(self.handle(id)?.lock().clone())
    }

    pub fn find_by_change_id(&self, change_id: &str) -> Option<Execution> {
        let id = *self.by_change_id.get(change_id)?;
        self.get_execution(id).ok()
    }

    /// Matching executions, newest first
    pub fn query_executions(&self, filter: &ExecutionFilter) -> Vec<Execution> {
        let handles: Vec<Arc<Mutex<Execution>>> = self
            .executions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut matching: Vec<Execution> = handles
            .iter()
            .filter_map(|handle| {
                let execution = handle.lock();
                filter.matches(&execution).then(|| execution.clone())
            })
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        matching
    }

    /// Aggregate over executions created within `window`
    pub fn execution_summary(&self, window: Duration) -> ExecutionSummary {
        let now = Utc::now();
        let since = ChronoDuration::from_std(window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window));
        let filter = ExecutionFilter {
            since,
            ..ExecutionFilter::default()
        };
        ExecutionSummary::from_executions(&self.query_executions(&filter), window, now)
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    pub fn duplicates_rejected(&self) -> u64 {
        self.stats.duplicates.load(Ordering::Relaxed)
    }

    pub fn resumed(&self) -> u64 {
        self.stats.resumed.load(Ordering::Relaxed)
    }
}
