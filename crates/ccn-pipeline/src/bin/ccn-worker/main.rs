//! CCN Worker - Main Entry Point

use anyhow::Context;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::config::Region;
use ccn_common::{FacadeSink, MetricsSink};
use ccn_credentials::{CredentialManager, StsExchange};
use ccn_isolation::IsolationValidator;
use ccn_pipeline::{
    DeadLetterQueue, MessageProcessor, NotificationOperation, Pipeline, PipelineComponents,
    PipelineError, ServiceConfig, SqsDeadLetterQueue, SqsNotificationSender, SqsQueue,
};
use ccn_resilience::ResilienceController;
use ccn_tracker::ExecutionTracker;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("CCN Worker v{}", env!("CARGO_PKG_VERSION"));

    // Load config
    let config_path = ServiceConfig::path_from_env();
    let mut config = ServiceConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.apply_env_overrides()?;
    config.validate()?;

    if let Some(addr) = config.metrics_listen {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing prometheus exporter")?;
        tracing::info!(%addr, "Metrics exporter listening");
    }

    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = config.region.clone() {
        loader = loader.region(Region::new(region));
    }
    let sdk_config = loader.load().await;

    let pipeline = build_pipeline(&config, &sdk_config)?;
    pipeline.start().await?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("Shutdown requested");

    match pipeline.shutdown().await {
        Ok(()) => {
            let metrics = pipeline.metrics();
            tracing::info!(
                received = metrics.received,
                acknowledged = metrics.acknowledged,
                dead_lettered = metrics.dead_lettered,
                "CCN Worker stopped"
            );
            Ok(())
        }
        Err(e @ PipelineError::ShutdownTimeout { .. }) => {
            tracing::error!(error = %e, "Forced exit");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

fn build_pipeline(config: &ServiceConfig, sdk_config: &aws_config::SdkConfig) -> anyhow::Result<Pipeline> {
    let sink: Arc<dyn MetricsSink> = Arc::new(FacadeSink);
    let registry = Arc::new(config.registry()?);
    tracing::info!(tenants = registry.len(), "Tenant registry loaded");

    let credentials = Arc::new(
        CredentialManager::new(
            registry,
            Arc::new(StsExchange::new(sdk_config)),
            config.credentials.clone(),
        )
        .with_sink(Arc::clone(&sink)),
    );
    let validator = Arc::new(
        IsolationValidator::new(Arc::clone(&credentials), config.isolation.clone())?
            .with_sink(Arc::clone(&sink)),
    );
    let resilience = Arc::new(
        ResilienceController::new(config.resilience.clone()).with_sink(Arc::clone(&sink)),
    );
    let tracker = Arc::new(
        ExecutionTracker::new(Arc::clone(credentials.registry())).with_sink(Arc::clone(&sink)),
    );

    let queue = SqsQueue::new(sdk_config, config.pipeline.queue_url.clone())
        .with_visibility_timeout(config.pipeline.visibility_timeout);
    let dead_letter = config
        .pipeline
        .dead_letter_queue_url
        .clone()
        .map(|url| Arc::new(SqsDeadLetterQueue::new(sdk_config, url)) as Arc<dyn DeadLetterQueue>);
    if dead_letter.is_none() {
        tracing::warn!("No dead-letter queue configured; failed messages stay on the source queue");
    }

    let components = PipelineComponents {
        credentials,
        validator,
        resilience,
        tracker,
        operation: Arc::new(NotificationOperation::new(Arc::new(SqsNotificationSender::new(
            sdk_config,
        )))),
        queue: Arc::new(queue),
        dead_letter,
    };

    let processor = MessageProcessor::new(config.pipeline.clone(), components).with_sink(sink);
    Ok(Pipeline::new(processor))
}
