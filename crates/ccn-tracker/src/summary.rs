//! Queries and aggregate summaries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::model::{CustomerState, Execution, ExecutionStatus};

/// Execution query. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionFilter {
    pub status: Option<ExecutionStatus>,
    /// Execution includes this tenant
    pub tenant: Option<String>,
    pub initiator: Option<String>,
    /// Created at or after
    pub since: Option<DateTime<Utc>>,
    /// Created before
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn initiator(mut self, initiator: impl Into<String>) -> Self {
        self.initiator = Some(initiator.into());
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, execution: &Execution) -> bool {
        if self.status.is_some_and(|status| status != execution.status) {
            return false;
        }
        if let Some(tenant) = &self.tenant {
            if !execution.customers.contains_key(tenant) {
                return false;
            }
        }
        if let Some(initiator) = &self.initiator {
            if &execution.initiator != initiator {
                return false;
            }
        }
        if self.since.is_some_and(|since| execution.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| execution.created_at >= until) {
            return false;
        }
        true
    }
}

/// Per-tenant outcome counts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantStats {
    pub executions: usize,
    pub completed: usize,
    pub failed: usize,
    pub average_duration_ms: f64,
}

impl TenantStats {
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.completed as f64 / finished as f64
        }
    }
}

/// Duration statistics over finished executions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    pub finished: usize,
    pub average_duration_ms: f64,
    pub fastest_execution: Option<Uuid>,
    pub fastest_duration_ms: Option<u64>,
    pub slowest_execution: Option<Uuid>,
    pub slowest_duration_ms: Option<u64>,
    /// Finished executions per hour over the window
    pub throughput_per_hour: f64,
}

/// Aggregate view over a time window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub window_secs: u64,
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub by_status: BTreeMap<ExecutionStatus, usize>,
    pub tenants: BTreeMap<String, TenantStats>,
    pub performance: PerformanceStats,
}

impl ExecutionSummary {
    pub fn from_executions(executions: &[Execution], window: Duration, now: DateTime<Utc>) -> Self {
        let mut by_status: BTreeMap<ExecutionStatus, usize> = BTreeMap::new();
        let mut tenants: BTreeMap<String, TenantStats> = BTreeMap::new();
        let mut tenant_durations: BTreeMap<String, (u64, usize)> = BTreeMap::new();

        for execution in executions {
            *by_status.entry(execution.status).or_insert(0) += 1;

            for customer in execution.customers.values() {
                let stats = tenants.entry(customer.tenant_code.clone()).or_default();
                stats.executions += 1;
                match customer.status {
                    CustomerState::Completed => stats.completed += 1,
                    CustomerState::Failed => stats.failed += 1,
                    _ => {}
                }
                if let Some(duration) = customer.duration_ms {
                    let (sum, count) = tenant_durations
                        .entry(customer.tenant_code.clone())
                        .or_insert((0, 0));
                    *sum += duration;
                    *count += 1;
                }
            }
        }

        for (tenant, (sum, count)) in tenant_durations {
            if let Some(stats) = tenants.get_mut(&tenant) {
                stats.average_duration_ms = sum as f64 / count as f64;
            }
        }

        Self {
            window_secs: window.as_secs(),
            generated_at: now,
            total: executions.len(),
            by_status,
            tenants,
            performance: performance(executions, window),
        }
    }

    pub fn count(&self, status: ExecutionStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

fn performance(executions: &[Execution], window: Duration) -> PerformanceStats {
    let finished: Vec<(Uuid, u64)> = executions
        .iter()
        .filter(|e| e.status.is_terminal())
        .filter_map(|e| e.duration_ms.map(|d| (e.id, d)))
        .collect();

    if finished.is_empty() {
        return PerformanceStats::default();
    }

    let total: u64 = finished.iter().map(|(_, d)| d).sum();
    let fastest = finished.iter().min_by_key(|(_, d)| *d);
    let slowest = finished.iter().max_by_key(|(_, d)| *d);
    let hours = window.as_secs_f64() / 3600.0;

    PerformanceStats {
        finished: finished.len(),
        average_duration_ms: total as f64 / finished.len() as f64,
        fastest_execution: fastest.map(|(id, _)| *id),
        fastest_duration_ms: fastest.map(|(_, d)| *d),
        slowest_execution: slowest.map(|(id, _)| *id),
        slowest_duration_ms: slowest.map(|(_, d)| *d),
        throughput_per_hour: if hours > 0.0 {
            finished.len() as f64 / hours
        } else {
            0.0
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CustomerOutcome, CustomerStatus};
    use crate::ExecutionTracker;
    use ccn_common::tenant::fixtures;
    use ccn_common::ErrorCategory;
    use std::sync::Arc;

    fn execution(status: ExecutionStatus, duration_ms: Option<u64>) -> Execution {
        let mut customers = BTreeMap::new();
        let mut acme = CustomerStatus::pending("acme");
        acme.status = CustomerState::Completed;
        acme.duration_ms = Some(40);
        customers.insert("acme".to_string(), acme);
        Execution {
            id: Uuid::new_v4(),
            change_id: Uuid::new_v4().to_string(),
            title: "t".into(),
            description: "d".into(),
            initiator: "ops".into(),
            status,
            customers,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms,
            metrics: None,
            error_summary: None,
            disposition: None,
        }
    }

    #[test]
    fn test_filter_matching() {
        let exec = execution(ExecutionStatus::Completed, Some(10));
        assert!(ExecutionFilter::new().matches(&exec));
        assert!(ExecutionFilter::new().status(ExecutionStatus::Completed).matches(&exec));
        assert!(!ExecutionFilter::new().status(ExecutionStatus::Failed).matches(&exec));
        assert!(ExecutionFilter::new().tenant("acme").matches(&exec));
        assert!(!ExecutionFilter::new().tenant("globex").matches(&exec));
        assert!(!ExecutionFilter::new().initiator("someone").matches(&exec));

        let hour = chrono::Duration::hours(1);
        assert!(ExecutionFilter::new()
            .between(exec.created_at - hour, exec.created_at + hour)
            .matches(&exec));
        assert!(!ExecutionFilter::new()
            .between(exec.created_at + hour, exec.created_at + hour * 2)
            .matches(&exec));
    }

    #[test]
    fn test_performance_stats() {
        let fast = execution(ExecutionStatus::Completed, Some(100));
        let slow = execution(ExecutionStatus::Partial, Some(300));
        let running = execution(ExecutionStatus::Running, None);
        let summary = ExecutionSummary::from_executions(
            &[fast.clone(), slow.clone(), running],
            Duration::from_secs(3600),
            Utc::now(),
        );

        assert_eq!(summary.total, 3);
        assert_eq!(summary.count(ExecutionStatus::Completed), 1);
        assert_eq!(summary.count(ExecutionStatus::Running), 1);
        assert_eq!(summary.count(ExecutionStatus::Failed), 0);

        let perf = &summary.performance;
        assert_eq!(perf.finished, 2);
        assert_eq!(perf.average_duration_ms, 200.0);
        assert_eq!(perf.fastest_execution, Some(fast.id));
        assert_eq!(perf.slowest_execution, Some(slow.id));
        assert_eq!(perf.throughput_per_hour, 2.0);

        let acme = &summary.tenants["acme"];
        assert_eq!(acme.executions, 3);
        assert_eq!(acme.completed, 3);
        assert_eq!(acme.average_duration_ms, 40.0);
    }

    #[test]
    fn test_tracker_query_and_summary() {
        let tracker = ExecutionTracker::new(Arc::new(fixtures::registry()));
        let acme = vec!["acme".to_string()];
        let both = vec!["acme".to_string(), "globex".to_string()];

        let first = tracker.start_execution("CHG-1", "t", "d", "alice", &acme).unwrap();
        let second = tracker.start_execution("CHG-2", "t", "d", "bob", &both).unwrap();
        let _third = tracker.start_execution("CHG-3", "t", "d", "bob", &both).unwrap();

        tracker
            .complete_customer_execution(first, "acme", CustomerOutcome::Succeeded)
            .unwrap();
        tracker
            .complete_customer_execution(second, "acme", CustomerOutcome::Succeeded)
            .unwrap();
        tracker
            .complete_customer_execution(
                second,
                "globex",
                CustomerOutcome::Failed {
                    category: ErrorCategory::Throttling,
                    message: "rate exceeded".into(),
                },
            )
            .unwrap();

        let by_bob = tracker.query_executions(&ExecutionFilter::new().initiator("bob"));
        assert_eq!(by_bob.len(), 2);
        assert!(by_bob[0].created_at >= by_bob[1].created_at);

        let partial = tracker.query_executions(&ExecutionFilter::new().status(ExecutionStatus::Partial));
        assert_eq!(partial.len(), 1);
        assert_eq!(partial[0].id, second);

        let globex = tracker.query_executions(&ExecutionFilter::new().tenant("globex").limit(1));
        assert_eq!(globex.len(), 1);

        let summary = tracker.execution_summary(Duration::from_secs(3600));
        assert_eq!(summary.total, 3);
        assert_eq!(summary.count(ExecutionStatus::Completed), 1);
        assert_eq!(summary.count(ExecutionStatus::Partial), 1);
        assert_eq!(summary.count(ExecutionStatus::Pending), 1);
        assert_eq!(summary.tenants["globex"].failed, 1);
        assert_eq!(summary.tenants["acme"].completed, 2);
        assert_eq!(summary.tenants["acme"].success_rate(), 1.0);
        assert_eq!(summary.performance.finished, 2);
    }
}
