use anyhow::Result;
use chrono::Utc;
use serde_json::json;

use courier_core::redis::{get_connection, RedisPool};
use courier_core::store::DynStore;
use courier_core::types::{
    delivery_id, Channel, Delivery, DeliveryStatus, InboxNotification, ProviderResult,
    WorkerRequest,
};
use courier_core::EngineResult;

use crate::dispatcher::DispatchOutcome;

/// The one channel served from our own store. Writes the user-facing inbox
/// record and a `delivered` ledger row in the same pass; there is no provider
/// to wait for.
pub struct InappWorker {
    store: DynStore,
    redis_pool: Option<RedisPool>,
}

impl InappWorker {
    pub fn new(store: DynStore, redis_pool: Option<RedisPool>) -> Self {
        Self { store, redis_pool }
    }

    pub async fn handle(&self, req: &WorkerRequest) -> EngineResult<DispatchOutcome> {
        let uid = req.uid.as_deref().unwrap_or_default();
        let id = delivery_id(&req.job_id, Channel::Inapp, uid);
        let now = Utc::now();

        let item = InboxNotification {
            id: id.clone(),
            uid: uid.to_string(),
            job_id: req.job_id.clone(),
            title: req.payload.title.clone(),
            body: req.payload.body.clone(),
            action_url: req.payload.action_url.clone(),
            topic: req.topic.clone(),
            read: false,
            read_at: None,
            created_at: now,
        };
        let inserted = self.store.insert_inbox(&item).await?;

        // Cache and counter updates are best-effort; the store row is the
        // source of truth. Only the first insert moves the counter.
        if inserted {
            if let Some(pool) = &self.redis_pool {
                if let Err(e) = cache_inbox_entry(pool, &item).await {
                    tracing::warn!("Failed to update inbox cache for {}: {}", uid, e);
                }
            }
        }

        let meta = json!({ "inbox_id": id });
        let result = ProviderResult::sent("inapp", None).with_meta(meta.clone());

        let row = Delivery {
            id: id.clone(),
            job_id: req.job_id.clone(),
            uid: Some(uid.to_string()),
            channel: Channel::Inapp,
            status: DeliveryStatus::Delivered,
            provider: Some("inapp".to_string()),
            provider_message_id: None,
            error_code: None,
            error_message: None,
            attempts: 1,
            meta: Some(meta),
            events: vec![],
            created_at: now,
            sent_at: Some(now),
            delivered_at: Some(now),
            read_at: None,
        };
        self.store.upsert_delivery(&row).await?;

        Ok(DispatchOutcome {
            delivery_id: id,
            result,
            retryable: false,
        })
    }
}

async fn cache_inbox_entry(pool: &RedisPool, item: &InboxNotification) -> Result<()> {
    let mut conn = get_connection(pool).await?;
    let key = format!("INBOX:{}", item.uid);

    redis::cmd("LPUSH")
        .arg(&key)
        .arg(serde_json::to_string(item)?)
        .query_async::<()>(&mut conn)
        .await?;

    // Keep only the last 100 entries
    redis::cmd("LTRIM")
        .arg(&key)
        .arg(0)
        .arg(99)
        .query_async::<()>(&mut conn)
        .await?;

    redis::cmd("INCR")
        .arg(format!("UNREAD:{}", item.uid))
        .query_async::<i64>(&mut conn)
        .await?;

    Ok(())
}
