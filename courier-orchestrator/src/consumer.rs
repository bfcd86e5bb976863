use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rdkafka::consumer::Consumer;
use rdkafka::Message;

use courier_core::EngineContext;
use courier_workers::Dispatcher;

use crate::audience::AudienceResolvers;
use crate::service::Orchestrator;

pub async fn run(ctx: EngineContext, dispatcher: Arc<Dispatcher>) -> Result<()> {
    tracing::info!("Starting job consumer");

    let consumer = ctx.create_consumer(Some("courier-orchestrator"))?;
    let service = Orchestrator::new(
        ctx.store.clone(),
        dispatcher,
        AudienceResolvers::with_defaults(),
        ctx.config.dispatch.clone(),
    );

    let topic = ctx.config.kafka.jobs_topic.clone();
    consumer.subscribe(&[topic.as_str()])?;

    tracing::info!("Subscribed to topic: {}", topic);

    let mut error_count = 0u32;
    let mut last_error_log = std::time::Instant::now();

    loop {
        match consumer.recv().await {
            Ok(message) => {
                error_count = 0; // Reset error count on success
                if let Some(payload) = message.payload() {
                    match handle_event(&service, payload).await {
                        Ok(_) => {
                            tracing::debug!("Processed job event");
                        }
                        Err(e) => {
                            tracing::error!("Error processing job event: {}", e);
                        }
                    }
                }
            }
            Err(e) => {
                error_count += 1;
                // Only log errors every 30 seconds to reduce log spam
                if last_error_log.elapsed().as_secs() >= 30 {
                    tracing::warn!(
                        "Error receiving message from Kafka (error count: {}): {}",
                        error_count,
                        e
                    );
                    last_error_log = std::time::Instant::now();
                }
                // Exponential backoff: 1s, 2s, 4s, max 30s
                let backoff =
                    Duration::from_secs(1 << error_count.min(5)).min(Duration::from_secs(30));
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

async fn handle_event(service: &Orchestrator, payload: &[u8]) -> Result<()> {
    let event: serde_json::Value = serde_json::from_slice(payload)?;

    let job_id = event
        .get("job_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("Missing job_id"))?;

    service.process_job(job_id).await
}
