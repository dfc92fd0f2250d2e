//! Per-key circuit breakers

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use crate::policy::CircuitBreakerConfig;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Snapshot of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerState {
    pub key: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_transition: DateTime<Utc>,
    pub trips: u64,
}

#[derive(Debug)]
struct BreakerCell {
    snapshot: CircuitBreakerState,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerCell {
    fn new(key: &str) -> Self {
        Self {
            snapshot: CircuitBreakerState {
                key: key.to_string(),
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_transition: Utc::now(),
                trips: 0,
            },
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn transition(&mut self, to: BreakerState) {
        tracing::debug!(key = %self.snapshot.key, from = ?self.snapshot.state, to = ?to, "Breaker transition");
        self.snapshot.state = to;
        self.snapshot.last_transition = Utc::now();
    }

    fn open(&mut self) {
        self.transition(BreakerState::Open);
        self.opened_at = Some(Instant::now());
        self.trial_in_flight = false;
        self.snapshot.trips += 1;
    }
}

/// Admission decision for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Call may proceed; `trial` marks the single half-open probe
    Allowed { trial: bool },
    /// Fail fast
    Rejected { retry_after: Duration },
}

/// Sharded breaker table. Each key's cell is locked only for the duration of
/// a state update, never across the guarded call.
#[derive(Debug)]
pub struct BreakerTable {
    cells: DashMap<String, BreakerCell>,
    config: CircuitBreakerConfig,
}

impl BreakerTable {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            cells: DashMap::new(),
            config,
        }
    }

    /// Decide whether a call for `key` may run now
    pub fn admit(&self, key: &str) -> Admission {
        let mut cell = self
            .cells
            .entry(key.to_string())
            .or_insert_with(|| BreakerCell::new(key));

        match cell.snapshot.state {
            BreakerState::Closed => Admission::Allowed { trial: false },
            BreakerState::Open => {
                let elapsed = cell.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= self.config.cooldown {
                    cell.transition(BreakerState::HalfOpen);
                    cell.trial_in_flight = true;
                    Admission::Allowed { trial: true }
                } else {
                    Admission::Rejected {
                        retry_after: self.config.cooldown - elapsed,
                    }
                }
            }
            BreakerState::HalfOpen => {
                if cell.trial_in_flight {
                    Admission::Rejected {
                        retry_after: Duration::ZERO,
                    }
                } else {
                    cell.trial_in_flight = true;
                    Admission::Allowed { trial: true }
                }
            }
        }
    }

    /// Successful call closes the breaker
    pub fn record_success(&self, key: &str) {
        if let Some(mut cell) = self.cells.get_mut(key) {
            cell.snapshot.consecutive_failures = 0;
            cell.trial_in_flight = false;
            cell.opened_at = None;
            if cell.snapshot.state != BreakerState::Closed {
                cell.transition(BreakerState::Closed);
                tracing::info!(key = %key, "Circuit breaker closed");
            }
        }
    }

    /// Count a failure. Returns true when this failure opened the breaker.
    pub fn record_failure(&self, key: &str) -> bool {
        let mut cell = self
            .cells
            .entry(key.to_string())
            .or_insert_with(|| BreakerCell::new(key));

        cell.snapshot.consecutive_failures += 1;
        match cell.snapshot.state {
            BreakerState::HalfOpen => {
                cell.open();
                true
            }
            BreakerState::Closed if cell.snapshot.consecutive_failures >= self.config.failure_threshold => {
                cell.open();
                true
            }
            _ => false,
        }
    }

    /// Release a half-open trial whose outcome says nothing about the
    /// dependency's health
    pub fn release_trial(&self, key: &str) {
        if let Some(mut cell) = self.cells.get_mut(key) {
            if cell.snapshot.state == BreakerState::HalfOpen {
                cell.trial_in_flight = false;
            }
        }
    }

    /// Snapshot of one key
    pub fn state(&self, key: &str) -> Option<CircuitBreakerState> {
        self.cells.get(key).map(|cell| cell.snapshot.clone())
    }

    /// Snapshot of every key
    pub fn states(&self) -> Vec<CircuitBreakerState> {
        let mut states: Vec<_> = self.cells.iter().map(|cell| cell.snapshot.clone()).collect();
        states.sort_by(|a, b| a.key.cmp(&b.key));
        states
    }

    /// Force a key back to closed
    pub fn reset(&self, key: &str) -> bool {
        self.cells.remove(key).is_some()
    }

    /// Keys currently open or half-open
    pub fn open_count(&self) -> usize {
        self.cells
            .iter()
            .filter(|cell| cell.snapshot.state != BreakerState::Closed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> BreakerTable {
        BreakerTable::new(CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(10),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_after_threshold_then_half_open() {
        let table = table();
        assert!(!table.record_failure("acme:notification"));
        assert!(!table.record_failure("acme:notification"));
        assert!(table.record_failure("acme:notification"));

        assert!(matches!(table.admit("acme:notification"), Admission::Rejected { .. }));
        // Other keys are unaffected
        assert_eq!(table.admit("globex:notification"), Admission::Allowed { trial: false });

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(table.admit("acme:notification"), Admission::Allowed { trial: true });
        // Only one trial at a time
        assert!(matches!(table.admit("acme:notification"), Admission::Rejected { .. }));

        table.record_success("acme:notification");
        let state = table.state("acme:notification").unwrap();
        assert_eq!(state.state, BreakerState::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.trips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let table = table();
        for _ in 0..3 {
            table.record_failure("k");
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(table.admit("k"), Admission::Allowed { trial: true });
        assert!(table.record_failure("k"));
        assert_eq!(table.state("k").unwrap().state, BreakerState::Open);
        assert_eq!(table.open_count(), 1);

        assert!(table.reset("k"));
        assert_eq!(table.admit("k"), Admission::Allowed { trial: false });
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_trial_allows_another() {
        let table = table();
        for _ in 0..3 {
            table.record_failure("k");
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(table.admit("k"), Admission::Allowed { trial: true });
        table.release_trial("k");
        assert_eq!(table.admit("k"), Admission::Allowed { trial: true });
    }
}
