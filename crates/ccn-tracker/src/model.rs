//! Execution data model

use ccn_common::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Overall execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Partial,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Partial)
    }
}

/// Per-tenant status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl CustomerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

macro_rules! display_as_debug {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        })*
    };
}

/// How the message behind an execution was finally handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Acknowledged,
    DeadLettered,
}

display_as_debug!(ExecutionStatus, CustomerState, StepStatus, Disposition);

/// Milliseconds between two instants, never negative
pub(crate) fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

/// Unit of work inside a tenant's run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    /// Identifier returned by the downstream system, e.g. a queue message id
    pub reference: Option<String>,
}

impl Step {
    pub(crate) fn new(id: String, name: &str, description: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            description: description.to_string(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error: None,
            reference: None,
        }
    }
}

/// One tenant's part of an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerStatus {
    pub tenant_code: String,
    pub status: CustomerState,
    pub steps: Vec<Step>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub error_category: Option<ErrorCategory>,
}

impl CustomerStatus {
    pub(crate) fn pending(tenant_code: &str) -> Self {
        Self {
            tenant_code: tenant_code.to_string(),
            status: CustomerState::Pending,
            steps: Vec::new(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error: None,
            error_category: None,
        }
    }
}

/// How a tenant's run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomerOutcome {
    Succeeded,
    Failed { category: ErrorCategory, message: String },
}

/// Metrics derived once, when the execution completes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub total_duration_ms: u64,
    pub average_tenant_duration_ms: f64,
    /// Completed tenants over all tenants, 0.0 to 1.0
    pub success_rate: f64,
    pub fastest_tenant: Option<String>,
    pub fastest_tenant_ms: Option<u64>,
    pub slowest_tenant: Option<String>,
    pub slowest_tenant_ms: Option<u64>,
    pub throughput_per_minute: f64,
}

/// Failure breakdown, present when any tenant failed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSummary {
    pub total_failures: usize,
    pub by_tenant: BTreeMap<String, usize>,
    pub by_category: BTreeMap<ErrorCategory, usize>,
    pub messages: BTreeMap<String, String>,
}

/// One change-notification run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: Uuid,
    pub change_id: String,
    pub title: String,
    pub description: String,
    pub initiator: String,
    pub status: ExecutionStatus,
    pub customers: BTreeMap<String, CustomerStatus>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub metrics: Option<ExecutionMetrics>,
    pub error_summary: Option<ErrorSummary>,
    /// Set once the message is deleted or dead-lettered; never cleared
    pub disposition: Option<Disposition>,
}

impl Execution {
    pub fn tenant_codes(&self) -> impl Iterator<Item = &str> {
        self.customers.keys().map(String::as_str)
    }

    pub fn all_customers_terminal(&self) -> bool {
        self.customers.values().all(|c| c.status.is_terminal())
    }

    /// Overall status implied by the tenants' terminal states
    pub(crate) fn derive_status(&self) -> ExecutionStatus {
        let total = self.customers.len();
        let completed = self
            .customers
            .values()
            .filter(|c| c.status == CustomerState::Completed)
            .count();
        let failed = self
            .customers
            .values()
            .filter(|c| c.status == CustomerState::Failed)
            .count();

        if completed == total {
            ExecutionStatus::Completed
        } else if failed == total {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Partial
        }
    }

    pub(crate) fn compute_metrics(&self, total_duration_ms: u64) -> ExecutionMetrics {
        let durations: Vec<(&str, u64)> = self
            .customers
            .values()
            .filter_map(|c| c.duration_ms.map(|d| (c.tenant_code.as_str(), d)))
            .collect();

        let total = self.customers.len();
        let completed = self
            .customers
            .values()
            .filter(|c| c.status == CustomerState::Completed)
            .count();

        let average = if durations.is_empty() {
            0.0
        } else {
            durations.iter().map(|(_, d)| *d as f64).sum::<f64>() / durations.len() as f64
        };
        let fastest = durations.iter().min_by_key(|(_, d)| *d);
        let slowest = durations.iter().max_by_key(|(_, d)| *d);

        ExecutionMetrics {
            total_duration_ms,
            average_tenant_duration_ms: average,
            success_rate: if total == 0 { 0.0 } else { completed as f64 / total as f64 },
            fastest_tenant: fastest.map(|(t, _)| t.to_string()),
            fastest_tenant_ms: fastest.map(|(_, d)| *d),
            slowest_tenant: slowest.map(|(t, _)| t.to_string()),
            slowest_tenant_ms: slowest.map(|(_, d)| *d),
            throughput_per_minute: total as f64 * 60_000.0 / total_duration_ms.max(1) as f64,
        }
    }

    pub(crate) fn compute_error_summary(&self) -> Option<ErrorSummary> {
        let mut summary = ErrorSummary::default();
        for customer in self.customers.values().filter(|c| c.status == CustomerState::Failed) {
            summary.total_failures += 1;
            *summary.by_tenant.entry(customer.tenant_code.clone()).or_insert(0) += 1;
            let category = customer.error_category.unwrap_or(ErrorCategory::Internal);
            *summary.by_category.entry(category).or_insert(0) += 1;
            if let Some(message) = &customer.error {
                summary.messages.insert(customer.tenant_code.clone(), message.clone());
            }
        }
        if summary.total_failures == 0 {
            None
        } else {
            Some(summary)
        }
    }
}
