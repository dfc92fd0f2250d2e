//! Poller, worker pool and lifecycle

use ccn_common::ShutdownSignal;
use ccn_credentials::CacheEntryStatus;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::processor::{MessageProcessor, PipelineMetrics};
use crate::queue::{QueueError, QueueMessage};
use crate::PipelineError;

/// Bound on the startup connectivity check and the metrics depth probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Message ingestion pipeline
///
/// One poller feeds a bounded buffer drained by `worker_count` workers.
/// A metrics task reports on `metrics_interval`. All tasks share one
/// [`ShutdownSignal`].
pub struct Pipeline {
    processor: Arc<MessageProcessor>,
    shutdown: ShutdownSignal,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(processor: MessageProcessor) -> Self {
        Self {
            processor: Arc::new(processor),
            shutdown: ShutdownSignal::new(),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn processor(&self) -> &MessageProcessor {
        &self.processor
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Check queue connectivity, then spawn the poller, workers and
    /// metrics reporter
    pub async fn start(&self) -> Result<(), PipelineError> {
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::Stopped);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyRunning);
        }

        let config = self.processor.config().clone();
        if let Err(e) = config.validate() {
            self.running.store(false, Ordering::SeqCst);
            return Err(PipelineError::Config(e));
        }

        let queue = Arc::clone(&self.processor.components().queue);
        let depth = match tokio::time::timeout(PROBE_TIMEOUT, queue.depth()).await {
            Ok(Ok(depth)) => depth,
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(PipelineError::Queue(e));
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(PipelineError::Queue(QueueError::Timeout));
            }
        };

        let (tx, rx) = mpsc::channel::<QueueMessage>(config.buffer_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut tasks = Vec::with_capacity(config.worker_count + 2);

        tasks.push(tokio::spawn(poll_loop(
            Arc::clone(&self.processor),
            tx,
            self.shutdown.clone(),
        )));
        for worker in 0..config.worker_count {
            tasks.push(tokio::spawn(worker_loop(
                worker,
                Arc::clone(&self.processor),
                Arc::clone(&rx),
                self.shutdown.clone(),
            )));
        }
        tasks.push(tokio::spawn(report_loop(
            Arc::clone(&self.processor),
            self.shutdown.clone(),
        )));
        *self.tasks.lock() = tasks;

        info!(
            workers = config.worker_count,
            buffer = config.buffer_size,
            queue_depth = depth,
            dead_letter = self.processor.components().dead_letter.is_some(),
            "Pipeline started"
        );
        Ok(())
    }

    /// Signal every task to stop and wait up to `shutdown_timeout`.
    ///
    /// In-flight messages finish; tasks still running at the deadline are
    /// left alone and reported as a timeout.
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        self.shutdown.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            self.running.store(false, Ordering::SeqCst);
            return Ok(());
        }

        let timeout = self.processor.config().shutdown_timeout;
        info!(tasks = tasks.len(), ?timeout, "Pipeline shutting down");
        let deadline = tokio::time::Instant::now() + timeout;

        for task in tasks.iter_mut() {
            match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Pipeline task ended abnormally"),
                Err(_) => break,
            }
        }

        let pending = tasks.iter().filter(|task| !task.is_finished()).count();
        self.running.store(false, Ordering::SeqCst);
        if pending > 0 {
            error!(pending, ?timeout, "Pipeline shutdown timed out");
            return Err(PipelineError::ShutdownTimeout { timeout, pending });
        }
        info!("Pipeline stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            running: self.is_running(),
            ..self.processor.metrics()
        }
    }

    pub fn cache_status(&self) -> BTreeMap<String, CacheEntryStatus> {
        self.processor.components().credentials.cache_status()
    }

    pub fn clear_credential_cache(&self) -> usize {
        self.processor.components().credentials.clear_cache()
    }

    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        self.processor.components().queue.depth().await
    }
}

async fn poll_loop(processor: Arc<MessageProcessor>, tx: mpsc::Sender<QueueMessage>, shutdown: ShutdownSignal) {
    let config = processor.config().clone();
    let queue = Arc::clone(&processor.components().queue);
    debug!("Poller started");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = queue.receive(config.max_messages, config.wait_time) => received,
        };

        match received {
            Ok(messages) => {
                for message in messages {
                    match tx.try_send(message) {
                        Ok(()) => {}
                        Err(TrySendError::Full(message)) => {
                            processor.stats.dropped.fetch_add(1, Ordering::Relaxed);
                            processor.sink().increment("ccn_messages_dropped_total", &[], 1);
                            warn!(
                                message_id = %message.message_id,
                                buffer = config.buffer_size,
                                "Buffer full, dropping message; scale workers or throttle the producer"
                            );
                        }
                        Err(TrySendError::Closed(_)) => return,
                    }
                }
            }
            Err(e) => {
                processor.stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                processor.sink().increment("ccn_queue_receive_errors_total", &[], 1);
                warn!(error = %e, "Queue receive failed");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }
    debug!("Poller stopped");
}

async fn worker_loop(
    worker: usize,
    processor: Arc<MessageProcessor>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueueMessage>>>,
    shutdown: ShutdownSignal,
) {
    debug!(worker, "Worker started");
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                message = rx.recv() => message,
            }
        };
        let Some(message) = next else {
            break;
        };
        processor.process_message(&message, &shutdown).await;
    }
    debug!(worker, "Worker stopped");
}

async fn report_loop(processor: Arc<MessageProcessor>, shutdown: ShutdownSignal) {
    let mut ticker = tokio::time::interval(processor.config().metrics_interval);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => report(&processor).await,
        }
    }
}

async fn report(processor: &MessageProcessor) {
    let sink = processor.sink();
    let metrics = processor.metrics();
    let queue = &processor.components().queue;

    match tokio::time::timeout(PROBE_TIMEOUT, queue.depth()).await {
        Ok(Ok(depth)) => sink.gauge("ccn_queue_depth", &[], depth as f64),
        Ok(Err(e)) => warn!(error = %e, "Queue depth probe failed"),
        Err(_) => warn!("Queue depth probe timed out"),
    }
    sink.gauge("ccn_messages_in_flight", &[], metrics.in_flight as f64);
    sink.gauge("ccn_open_circuit_breakers", &[], metrics.resilience.open_breakers as f64);
    sink.gauge("ccn_cached_credentials", &[], metrics.credentials.cached_keys as f64);

    info!(
        received = metrics.received,
        acknowledged = metrics.acknowledged,
        dead_lettered = metrics.dead_lettered,
        duplicates = metrics.duplicates,
        dropped = metrics.dropped,
        in_flight = metrics.in_flight,
        open_breakers = metrics.resilience.open_breakers,
        "Pipeline metrics"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::message::ChangeMessage;
    use crate::operation::{OperationError, TenantOperation};
    use crate::processor::tests::harness;
    use async_trait::async_trait;
    use ccn_common::{RecordingSink, ServiceKind};
    use ccn_credentials::ScopedClientConfig;
    use ccn_tracker::ExecutionStatus;

    fn config() -> PipelineConfig {
        PipelineConfig {
            queue_url: "memory://changes".into(),
            worker_count: 2,
            buffer_size: 4,
            wait_time: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(5),
            metrics_interval: Duration::from_secs(1),
            ..PipelineConfig::default()
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_processing() {
        let h = harness();
        let pipeline = Pipeline::new(MessageProcessor::new(config(), h.components.clone()));
        h.queue.push(r#"{"changeId":"chg-1","title":"t","customerCodes":["acme"],"templateId":"x"}"#);
        h.queue.push(r#"{"changeId":"chg-2","title":"t","customerCodes":["unknown"],"templateId":"x"}"#);

        pipeline.start().await.unwrap();
        assert!(pipeline.is_running());
        wait_until(|| h.queue.deleted().len() == 2).await;

        let execution = h.components.tracker.find_by_change_id("chg-1").unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(h.components.tracker.find_by_change_id("chg-2").is_none());
        assert_eq!(h.dead_letter.len(), 1);

        let metrics = pipeline.metrics();
        assert!(metrics.running);
        assert_eq!(metrics.acknowledged, 1);
        assert_eq!(metrics.dead_lettered, 1);
        assert_eq!(pipeline.cache_status().len(), 1);
        assert!(pipeline.cache_status().contains_key("acme:notification"));

        pipeline.shutdown().await.unwrap();
        assert!(!pipeline.is_running());
        assert_eq!(pipeline.clear_credential_cache(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_and_after_shutdown() {
        let h = harness();
        let pipeline = Pipeline::new(MessageProcessor::new(config(), h.components.clone()));
        pipeline.start().await.unwrap();
        assert!(matches!(pipeline.start().await, Err(PipelineError::AlreadyRunning)));

        pipeline.shutdown().await.unwrap();
        assert!(matches!(pipeline.start().await, Err(PipelineError::Stopped)));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let h = harness();
        let config = PipelineConfig {
            worker_count: 0,
            ..config()
        };
        let pipeline = Pipeline::new(MessageProcessor::new(config, h.components.clone()));
        assert!(matches!(pipeline.start().await, Err(PipelineError::Config(_))));
        assert!(!pipeline.is_running());
    }

    struct StuckOperation;

    #[async_trait]
    impl TenantOperation for StuckOperation {
        fn name(&self) -> &'static str {
            "stuck"
        }

        fn service(&self) -> ServiceKind {
            ServiceKind::Notification
        }

        async fn execute(&self, _: &ChangeMessage, _: &ScopedClientConfig) -> Result<Option<String>, OperationError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout_reported() {
        let h = harness();
        let mut components = h.components.clone();
        components.operation = Arc::new(StuckOperation);
        let pipeline = Pipeline::new(MessageProcessor::new(config(), components));
        h.queue.push(r#"{"changeId":"chg-1","title":"t","customerCodes":["acme"],"templateId":"x"}"#);

        pipeline.start().await.unwrap();
        wait_until(|| pipeline.metrics().in_flight == 1).await;

        match pipeline.shutdown().await {
            Err(PipelineError::ShutdownTimeout { pending, timeout }) => {
                assert_eq!(pending, 1);
                assert_eq!(timeout, Duration::from_secs(5));
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(h.queue.deleted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_buffer_drops_with_warning() {
        let h = harness();
        let mut components = h.components.clone();
        components.operation = Arc::new(StuckOperation);
        let config = PipelineConfig {
            worker_count: 1,
            buffer_size: 1,
            max_messages: 10,
            shutdown_timeout: Duration::from_millis(100),
            ..config()
        };
        let pipeline = Pipeline::new(MessageProcessor::new(config, components));
        for i in 0..5 {
            h.queue.push(format!(
                r#"{{"changeId":"chg-{}","title":"t","customerCodes":["acme"],"templateId":"x"}}"#,
                i
            ));
        }

        pipeline.start().await.unwrap();
        wait_until(|| pipeline.metrics().dropped > 0).await;
        assert!(pipeline.metrics().dropped >= 3);
        let _ = pipeline.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_errors_counted() {
        let h = harness();
        h.queue.fail_next_receive(QueueError::Transport("connection reset".into()));
        let pipeline = Pipeline::new(MessageProcessor::new(config(), h.components.clone()));

        pipeline.start().await.unwrap();
        wait_until(|| h.queue.receive_calls() >= 2).await;
        assert_eq!(pipeline.metrics().receive_errors, 1);
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_reporter_publishes_gauges() {
        let h = harness();
        let sink = RecordingSink::new();
        let processor = MessageProcessor::new(config(), h.components.clone()).with_sink(sink.clone());
        let pipeline = Pipeline::new(processor);
        h.queue.push("{broken");

        pipeline.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(sink.gauge_value("ccn_queue_depth", &[]), Some(0.0));
        assert!(sink.gauge_value("ccn_messages_in_flight", &[]).is_some());
        assert_eq!(pipeline.queue_depth().await.unwrap(), 0);
        pipeline.shutdown().await.unwrap();
    }
}
