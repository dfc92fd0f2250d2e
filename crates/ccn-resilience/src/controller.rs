//! Retry loop and counters

use ccn_common::{Classify, MetricsSink, NoopSink, ShutdownSignal};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::breaker::{Admission, BreakerTable, CircuitBreakerState};
use crate::policy::{ResilienceConfig, RetryPolicy};
use crate::ResilienceError;

#[derive(Debug, Default)]
struct ResilienceStats {
    total_errors: AtomicU64,
    breaker_trips: AtomicU64,
    dead_letters: AtomicU64,
    retries: AtomicU64,
    short_circuits: AtomicU64,
}

/// Point-in-time resilience counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResilienceMetrics {
    pub total_errors: u64,
    pub breaker_trips: u64,
    pub dead_letters: u64,
    pub retries: u64,
    pub short_circuits: u64,
    pub open_breakers: usize,
}

/// Retry/backoff plus per-key circuit breaking
pub struct ResilienceController {
    retry: RetryPolicy,
    breakers: BreakerTable,
    stats: ResilienceStats,
    sink: Arc<dyn MetricsSink>,
}

impl ResilienceController {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            retry: config.retry,
            breakers: BreakerTable::new(config.breaker),
            stats: ResilienceStats::default(),
            sink: Arc::new(NoopSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run `operation` under the breaker for `key`, retrying retryable
    /// failures with exponential backoff.
    ///
    /// The breaker is consulted before every attempt. Shutdown is checked
    /// before every attempt and while sleeping between attempts; an attempt
    /// already running is never interrupted.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        shutdown: &ShutdownSignal,
        key: &str,
        mut operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::error::Error + 'static,
    {
        let mut attempts = 0u32;
        let mut last_error: Option<E> = None;

        loop {
            if shutdown.is_cancelled() {
                return Err(ResilienceError::Cancelled {
                    key: key.to_string(),
                    attempts,
                });
            }

            if let Admission::Rejected { retry_after } = self.breakers.admit(key) {
                self.stats.short_circuits.fetch_add(1, Ordering::Relaxed);
                self.sink.increment("ccn_short_circuits_total", &[("key", key.to_string())], 1);
                // Breaker opened mid-cycle: surface the failure that opened it
                if let Some(source) = last_error {
                    return Err(ResilienceError::Failed {
                        key: key.to_string(),
                        attempts,
                        source,
                    });
                }
                tracing::debug!(key = %key, ?retry_after, "Circuit open, failing fast");
                return Err(ResilienceError::CircuitOpen {
                    key: key.to_string(),
                    retry_after,
                });
            }

            attempts += 1;
            let started = Instant::now();
            let result = operation().await;
            self.sink.histogram(
                "ccn_operation_latency_seconds",
                &[("key", key.to_string())],
                started.elapsed().as_secs_f64(),
            );

            let error = match result {
                Ok(value) => {
                    self.breakers.record_success(key);
                    return Ok(value);
                }
                Err(error) => error,
            };

            let category = error.category();
            self.stats.total_errors.fetch_add(1, Ordering::Relaxed);
            self.sink.increment(
                "ccn_errors_total",
                &[("key", key.to_string()), ("category", category.to_string())],
                1,
            );

            if category.trips_breaker() {
                if self.breakers.record_failure(key) {
                    self.stats.breaker_trips.fetch_add(1, Ordering::Relaxed);
                    self.sink.increment("ccn_circuit_breaker_trips_total", &[("key", key.to_string())], 1);
                    tracing::warn!(key = %key, error = %error, "Circuit breaker opened");
                }
            } else {
                self.breakers.release_trial(key);
            }

            if !error.is_retryable() || attempts >= self.retry.max_attempts {
                tracing::debug!(key = %key, attempts, category = %category, "Giving up");
                return Err(ResilienceError::Failed {
                    key: key.to_string(),
                    attempts,
                    source: error,
                });
            }

            let delay = self.retry.delay_for(attempts);
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, attempt = attempts, ?delay, error = %error, "Retrying");
            last_error = Some(error);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => {
                    return Err(ResilienceError::Cancelled {
                        key: key.to_string(),
                        attempts,
                    });
                }
            }
        }
    }

    /// Count a dead-lettered message
    pub fn record_dead_letter(&self, tenant: Option<&str>) {
        self.stats.dead_letters.fetch_add(1, Ordering::Relaxed);
        let tenant = tenant.unwrap_or("none").to_string();
        self.sink.increment("ccn_dead_letters_total", &[("tenant", tenant)], 1);
    }

    pub fn breaker_state(&self, key: &str) -> Option<CircuitBreakerState> {
        self.breakers.state(key)
    }

    pub fn breaker_states(&self) -> Vec<CircuitBreakerState> {
        self.breakers.states()
    }

    /// Force a breaker closed
    pub fn reset(&self, key: &str) -> bool {
        let reset = self.breakers.reset(key);
        if reset {
            tracing::info!(key = %key, "Circuit breaker reset");
        }
        reset
    }

    pub fn metrics(&self) -> ResilienceMetrics {
        ResilienceMetrics {
            total_errors: self.stats.total_errors.load(Ordering::Relaxed),
            breaker_trips: self.stats.breaker_trips.load(Ordering::Relaxed),
            dead_letters: self.stats.dead_letters.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            short_circuits: self.stats.short_circuits.load(Ordering::Relaxed),
            open_breakers: self.breakers.open_count(),
        }
    }
}

impl Default for ResilienceController {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::policy::CircuitBreakerConfig;
    use ccn_common::{ErrorCategory, RecordingSink};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use thiserror::Error;

    #[derive(Debug, Error)]
    enum OpError {
        #[error("connection reset")]
        Transient,
        #[error("bad template")]
        Invalid,
        #[error("access denied")]
        Denied,
    }

    impl Classify for OpError {
        fn category(&self) -> ErrorCategory {
            match self {
                Self::Transient => ErrorCategory::Network,
                Self::Invalid => ErrorCategory::Validation,
                Self::Denied => ErrorCategory::PermissionDenied,
            }
        }
    }

    fn controller(max_attempts: u32, failure_threshold: u32) -> ResilienceController {
        ResilienceController::new(ResilienceConfig {
            retry: RetryPolicy {
                max_attempts,
                initial_delay: Duration::from_millis(100),
                multiplier: 2.0,
                max_delay: Duration::from_secs(1),
            },
            breaker: CircuitBreakerConfig {
                failure_threshold,
                cooldown: Duration::from_secs(30),
            },
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let controller = controller(5, 10);
        let shutdown = ShutdownSignal::new();
        let calls = AtomicU32::new(0);

        let result = controller
            .execute_with_retry(&shutdown, "acme:notification", || {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if call < 3 {
                        Err(OpError::Transient)
                    } else {
                        Ok(call)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        let metrics = controller.metrics();
        assert_eq!(metrics.retries, 2);
        assert_eq!(metrics.total_errors, 2);
        assert_eq!(
            controller.breaker_state("acme:notification").unwrap().consecutive_failures,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let controller = controller(5, 10);
        let shutdown = ShutdownSignal::new();
        let calls = AtomicU32::new(0);

        let err = controller
            .execute_with_retry(&shutdown, "acme:notification", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(OpError::Denied) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts(), 1);
        assert_eq!(err.category(), ErrorCategory::PermissionDenied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_fails_fast_after_threshold() {
        let controller = controller(1, 5);
        let shutdown = ShutdownSignal::new();
        let calls = AtomicU32::new(0);
        let op = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(OpError::Transient) }
        };

        for _ in 0..5 {
            let err = controller.execute_with_retry(&shutdown, "acme:notify", op).await.unwrap_err();
            assert!(matches!(err, ResilienceError::Failed { .. }));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let err = controller.execute_with_retry(&shutdown, "acme:notify", op).await.unwrap_err();
        assert!(matches!(err, ResilienceError::CircuitOpen { .. }));
        assert_eq!(err.category(), ErrorCategory::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let metrics = controller.metrics();
        assert_eq!(metrics.breaker_trips, 1);
        assert_eq!(metrics.short_circuits, 1);
        assert_eq!(metrics.open_breakers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_after_cooldown() {
        let controller = controller(1, 2);
        let shutdown = ShutdownSignal::new();

        for _ in 0..2 {
            let _ = controller
                .execute_with_retry(&shutdown, "globex:queue", || async { Err::<(), _>(OpError::Transient) })
                .await;
        }
        assert_eq!(controller.breaker_state("globex:queue").unwrap().state, BreakerState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        let ok = controller
            .execute_with_retry(&shutdown, "globex:queue", || async { Ok::<_, OpError>("sent") })
            .await;
        assert_eq!(ok.unwrap(), "sent");
        assert_eq!(controller.breaker_state("globex:queue").unwrap().state, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failures_do_not_trip() {
        let controller = controller(1, 2);
        let shutdown = ShutdownSignal::new();

        for _ in 0..5 {
            let _ = controller
                .execute_with_retry(&shutdown, "acme:notification", || async { Err::<(), _>(OpError::Invalid) })
                .await;
        }
        let state = controller.breaker_state("acme:notification").unwrap();
        assert_eq!(state.state, BreakerState::Closed);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trip_mid_cycle_reports_last_error() {
        let controller = controller(5, 2);
        let shutdown = ShutdownSignal::new();
        let calls = AtomicU32::new(0);

        let err = controller
            .execute_with_retry(&shutdown, "acme:storage", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(OpError::Transient) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(err, ResilienceError::Failed { attempts: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_between_attempts() {
        let controller = Arc::new(controller(10, 100));
        let shutdown = ShutdownSignal::new();

        let handle = {
            let controller = controller.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                controller
                    .execute_with_retry(&shutdown, "acme:notification", || async {
                        Err::<(), _>(OpError::Transient)
                    })
                    .await
            })
        };

        // First attempt fails immediately, then the loop sleeps 100ms
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ResilienceError::Cancelled { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_dead_letters_and_reset() {
        let sink = RecordingSink::new();
        let controller = controller(1, 1).with_sink(sink.clone());
        let shutdown = ShutdownSignal::new();

        let _ = controller
            .execute_with_retry(&shutdown, "acme:notification", || async { Err::<(), _>(OpError::Transient) })
            .await;
        controller.record_dead_letter(Some("acme"));

        assert_eq!(controller.metrics().dead_letters, 1);
        assert_eq!(sink.counter("ccn_dead_letters_total"), 1);
        assert_eq!(sink.counter("ccn_circuit_breaker_trips_total"), 1);
        assert!(controller.reset("acme:notification"));
        assert!(controller.breaker_state("acme:notification").is_none());
        assert_eq!(controller.breaker_states().len(), 0);
    }
}
