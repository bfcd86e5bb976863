use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;

use courier_core::store::DynStore;
use courier_core::types::{
    delivery_id, Channel, Delivery, DeliveryStatus, ProviderResult, SendContext, SendStatus,
    SendTarget, WorkerRequest,
};
use courier_core::EngineResult;
use courier_providers::Adapters;

use crate::dispatcher::DispatchOutcome;

/// Worker for every provider-backed channel. One invocation means one
/// provider call and exactly one ledger write; the ledger row id is
/// deterministic, so retries overwrite instead of duplicating.
pub struct ProviderWorker {
    store: DynStore,
    adapters: Arc<Adapters>,
}

impl ProviderWorker {
    pub fn new(store: DynStore, adapters: Arc<Adapters>) -> Self {
        Self { store, adapters }
    }

    pub async fn handle(
        &self,
        channel: Channel,
        req: &WorkerRequest,
    ) -> EngineResult<DispatchOutcome> {
        let adapter = self
            .adapters
            .for_channel(channel)
            .ok_or_else(|| anyhow!("no provider adapter for channel {}", channel))?;
        let target = SendTarget::from_value(channel, req.target.as_ref(), req.topic.as_deref())
            .ok_or_else(|| anyhow!("no target shape for channel {}", channel))?;

        let recipient_key = req
            .uid
            .clone()
            .or_else(|| target.recipient_key().map(|k| k.to_string()))
            .unwrap_or_default();
        let id = delivery_id(&req.job_id, channel, &recipient_key);

        let ctx = SendContext {
            job_id: req.job_id.clone(),
            uid: req.uid.clone(),
        };

        let (result, retryable) = match adapter.send(&target, &req.payload, &ctx).await {
            Ok(verdict) => (verdict, false),
            Err(e) => {
                tracing::warn!(
                    "{} send for job {} got no verdict: {}",
                    adapter.name(),
                    req.job_id,
                    e
                );
                (
                    ProviderResult::failed(adapter.name(), "transport", e.to_string()),
                    true,
                )
            }
        };

        let status = match result.status {
            SendStatus::Sent => DeliveryStatus::Sent,
            SendStatus::Failed => DeliveryStatus::Failed,
            SendStatus::Skipped => DeliveryStatus::Skipped,
        };
        let now = Utc::now();
        let row = Delivery {
            id: id.clone(),
            job_id: req.job_id.clone(),
            uid: req.uid.clone(),
            channel,
            status,
            provider: Some(result.provider.clone()),
            provider_message_id: result.provider_message_id.clone(),
            error_code: result.error_code.clone(),
            error_message: result.error_message.clone(),
            attempts: 1,
            meta: result.meta.clone(),
            events: vec![],
            created_at: now,
            sent_at: (status == DeliveryStatus::Sent).then_some(now),
            delivered_at: None,
            read_at: None,
        };
        self.store.upsert_delivery(&row).await?;

        Ok(DispatchOutcome {
            delivery_id: id,
            result,
            retryable,
        })
    }
}
