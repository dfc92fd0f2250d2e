//! Validation results and tenant reports

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::rules::{RuleCategory, Severity};

/// Outcome of one rule for one tenant
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub rule_id: String,
    pub rule_name: String,
    pub category: RuleCategory,
    pub severity: Severity,
    pub tenant_code: String,
    pub passed: bool,
    pub message: String,
    pub details: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub duration_micros: u64,
}

/// Every rule's result for one tenant
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantIsolationReport {
    pub tenant_code: String,
    pub results: Vec<ValidationResult>,
    pub passed: usize,
    pub failed: usize,
    pub evaluated_at: DateTime<Utc>,
    /// Services whose credential check hit a transient error and was not judged
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deferred_checks: Vec<String>,
}

impl TenantIsolationReport {
    pub fn new(tenant_code: &str, results: Vec<ValidationResult>) -> Self {
        let passed = results.iter().filter(|r| r.passed).count();
        Self {
            tenant_code: tenant_code.to_string(),
            failed: results.len() - passed,
            passed,
            results,
            evaluated_at: Utc::now(),
            deferred_checks: Vec::new(),
        }
    }

    pub fn with_deferred_checks(mut self, deferred: Vec<String>) -> Self {
        self.deferred_checks = deferred;
        self
    }

    /// Evaluated with every credential check conclusive
    pub fn is_conclusive(&self) -> bool {
        self.deferred_checks.is_empty()
    }

    /// No rule failed
    pub fn is_isolated(&self) -> bool {
        self.failed == 0
    }

    /// Failed results severe enough to stop work for the tenant
    pub fn blocking_failures(&self) -> Vec<&ValidationResult> {
        self.results
            .iter()
            .filter(|r| !r.passed && matches!(r.severity, Severity::Critical | Severity::High))
            .collect()
    }

    pub fn result(&self, rule_id: &str) -> Option<&ValidationResult> {
        self.results.iter().find(|r| r.rule_id == rule_id)
    }

    pub fn failed_rule_ids(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.rule_id.as_str())
            .collect()
    }
}
