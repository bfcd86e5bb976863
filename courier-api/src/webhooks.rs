use axum::body::Bytes;
use axum::extract::Extension;
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use courier_core::store::DynStore;
use courier_core::types::{ChatIdentity, DeliveryEvent, DeliveryStatus};
use courier_core::{EngineContext, EngineResult};

/// Zalo OA callback endpoint.
pub async fn zalo(Extension(ctx): Extension<EngineContext>, body: Bytes) -> Json<Value> {
    receive(&ctx, "zalo", &body).await
}

/// Viber bot callback endpoint.
pub async fn viber(Extension(ctx): Extension<EngineContext>, body: Bytes) -> Json<Value> {
    receive(&ctx, "viber", &body).await
}

/// Both platforms retry aggressively on anything but 200, so the response
/// is always `{ok: true}` and problems only reach the log.
async fn receive(ctx: &EngineContext, provider: &str, body: &[u8]) -> Json<Value> {
    match serde_json::from_slice::<Value>(body) {
        Ok(event) => {
            if let Err(e) = ingest(&ctx.store, provider, &event).await {
                tracing::error!("Failed to ingest {} webhook: {}", provider, e);
            }
        }
        Err(e) => {
            tracing::warn!("Unparseable {} webhook body: {}", provider, e);
        }
    }
    Json(json!({ "ok": true }))
}

async fn ingest(store: &DynStore, provider: &str, event: &Value) -> EngineResult<()> {
    let now = Utc::now();
    let name = event_name(provider, event).unwrap_or("unknown");
    let lowered = name.to_ascii_lowercase();

    // Follow-state events first; they carry no message id. The negative
    // forms are substrings of the positive ones, so they are tested first.
    if lowered.contains("unfollow") || lowered.contains("unsubscrib") {
        return follow_event(store, provider, event, false, now).await;
    }
    if lowered.contains("follow") || lowered.contains("subscrib") {
        return follow_event(store, provider, event, true, now).await;
    }

    let Some(message_id) = provider_message_id(provider, event) else {
        tracing::debug!("{} event '{}' carries no message id, dropped", provider, name);
        return Ok(());
    };

    let Some(mut row) = store
        .find_delivery_by_provider_message(provider, &message_id)
        .await?
    else {
        tracing::info!(
            "No delivery matched {} message {}, event '{}' dropped",
            provider,
            message_id,
            name
        );
        return Ok(());
    };

    // Last status wins: the new timestamp is set and the opposing one
    // cleared, even when events arrive out of order.
    let status = canonical_status(&lowered);
    row.status = status;
    match status {
        DeliveryStatus::Read => {
            row.read_at = Some(now);
            row.delivered_at = None;
        }
        DeliveryStatus::Delivered => {
            row.delivered_at = Some(now);
            row.read_at = None;
        }
        DeliveryStatus::Failed => {
            row.delivered_at = None;
            row.read_at = None;
        }
        _ => {}
    }
    row.events.push(DeliveryEvent {
        source: provider.to_string(),
        event: name.to_string(),
        raw: event.clone(),
        at: now,
    });
    store.update_delivery(&row).await?;

    tracing::debug!(
        "{} webhook moved delivery {} to {}",
        provider,
        row.id,
        status.as_str()
    );
    Ok(())
}

async fn follow_event(
    store: &DynStore,
    provider: &str,
    event: &Value,
    followed: bool,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    let Some(external_id) = external_user_id(event) else {
        tracing::warn!("{} follow-state event carries no user id, dropped", provider);
        return Ok(());
    };
    record_follow_state(store, provider, &external_id, followed, now).await
}

/// Updates the `followed` flag on a chat identity, creating the record on
/// first contact. An existing uid link survives an unfollow.
pub(crate) async fn record_follow_state(
    store: &DynStore,
    provider: &str,
    external_id: &str,
    followed: bool,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    let identity = match store.get_chat_identity(provider, external_id).await? {
        Some(mut existing) => {
            existing.followed = followed;
            existing.last_seen_at = now;
            existing.updated_at = now;
            existing
        }
        None => ChatIdentity {
            provider: provider.to_string(),
            external_id: external_id.to_string(),
            uid: None,
            followed,
            last_seen_at: now,
            updated_at: now,
        },
    };
    store.upsert_chat_identity(&identity).await
}

fn event_name<'a>(provider: &str, event: &'a Value) -> Option<&'a str> {
    let field = if provider == "zalo" { "event_name" } else { "event" };
    event.get(field).and_then(|v| v.as_str())
}

fn external_user_id(event: &Value) -> Option<String> {
    let candidates = [
        event.get("follower").and_then(|v| v.get("id")),
        event.get("user").and_then(|v| v.get("id")),
        event.get("sender").and_then(|v| v.get("id")),
        event.get("user_id"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str())
        .map(|s| s.to_string())
}

fn provider_message_id(provider: &str, event: &Value) -> Option<String> {
    if provider == "zalo" {
        return event
            .get("message")
            .and_then(|m| m.get("msg_id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
    }
    // Viber sends message_token as a bare number in some event versions.
    match event.get("message_token") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn canonical_status(lowered_event: &str) -> DeliveryStatus {
    if lowered_event.contains("seen") || lowered_event.contains("read") {
        DeliveryStatus::Read
    } else if lowered_event.contains("deliver") {
        DeliveryStatus::Delivered
    } else if lowered_event.contains("fail") || lowered_event.contains("error") {
        DeliveryStatus::Failed
    } else {
        DeliveryStatus::Sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use courier_core::store::MemoryStore;
    use courier_core::types::{delivery_id, Channel, Delivery};
    use std::sync::Arc;
    use tower::ServiceExt;

    use crate::test_support;

    fn sent_row(channel: Channel, provider: &str, message_id: &str) -> Delivery {
        let now = Utc::now();
        Delivery {
            id: delivery_id("job-1", channel, "recipient-1"),
            job_id: "job-1".to_string(),
            uid: Some("u1".to_string()),
            channel,
            status: DeliveryStatus::Sent,
            provider: Some(provider.to_string()),
            provider_message_id: Some(message_id.to_string()),
            error_code: None,
            error_message: None,
            attempts: 1,
            meta: None,
            events: vec![],
            created_at: now,
            sent_at: Some(now),
            delivered_at: None,
            read_at: None,
        }
    }

    #[tokio::test]
    async fn repeated_delivered_events_stay_delivered() {
        let store: DynStore = Arc::new(MemoryStore::new());
        let row = sent_row(Channel::Viber, "viber", "491266184665523");
        store.upsert_delivery(&row).await.unwrap();

        let event = json!({ "event": "delivered", "message_token": 491266184665523i64 });
        ingest(&store, "viber", &event).await.unwrap();
        ingest(&store, "viber", &event).await.unwrap();

        let stored = store.get_delivery(&row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Delivered);
        assert!(stored.delivered_at.is_some());
        assert!(stored.read_at.is_none());
        // The audit trail keeps both arrivals.
        assert_eq!(stored.events.len(), 2);
        assert_eq!(stored.events[0].event, "delivered");
        assert_eq!(stored.events[0].source, "viber");
    }

    #[tokio::test]
    async fn seen_after_delivered_clears_the_delivered_timestamp() {
        let store: DynStore = Arc::new(MemoryStore::new());
        let row = sent_row(Channel::Zalo, "zalo", "msg-9");
        store.upsert_delivery(&row).await.unwrap();

        let delivered = json!({
            "event_name": "user_received_message",
            "message": { "msg_id": "msg-9" },
        });
        let seen = json!({
            "event_name": "user_seen_message",
            "message": { "msg_id": "msg-9" },
        });
        ingest(&store, "zalo", &delivered).await.unwrap();
        ingest(&store, "zalo", &seen).await.unwrap();

        let stored = store.get_delivery(&row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Read);
        assert!(stored.read_at.is_some());
        assert!(stored.delivered_at.is_none());
    }

    #[tokio::test]
    async fn failure_events_clear_both_timestamps() {
        let store: DynStore = Arc::new(MemoryStore::new());
        let mut row = sent_row(Channel::Viber, "viber", "tok-3");
        row.delivered_at = Some(Utc::now());
        store.upsert_delivery(&row).await.unwrap();

        let event = json!({ "event": "failed", "message_token": "tok-3", "desc": "offline" });
        ingest(&store, "viber", &event).await.unwrap();

        let stored = store.get_delivery(&row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);
        assert!(stored.delivered_at.is_none());
        assert!(stored.read_at.is_none());
    }

    #[tokio::test]
    async fn unmatched_message_ids_are_dropped_quietly() {
        let store: DynStore = Arc::new(MemoryStore::new());
        let row = sent_row(Channel::Viber, "viber", "tok-known");
        store.upsert_delivery(&row).await.unwrap();

        let event = json!({ "event": "delivered", "message_token": "tok-unknown" });
        ingest(&store, "viber", &event).await.unwrap();

        let stored = store.get_delivery(&row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Sent);
        assert!(stored.events.is_empty());
    }

    #[tokio::test]
    async fn follow_state_toggles_without_losing_the_link() {
        let store: DynStore = Arc::new(MemoryStore::new());

        let follow = json!({ "event_name": "follow", "follower": { "id": "z-42" } });
        ingest(&store, "zalo", &follow).await.unwrap();
        let identity = store.get_chat_identity("zalo", "z-42").await.unwrap().unwrap();
        assert!(identity.followed);
        assert_eq!(identity.uid, None);

        // Linked elsewhere; the unfollow must keep the uid.
        let mut linked = identity.clone();
        linked.uid = Some("u9".to_string());
        store.upsert_chat_identity(&linked).await.unwrap();

        let unfollow = json!({ "event_name": "unfollow", "follower": { "id": "z-42" } });
        ingest(&store, "zalo", &unfollow).await.unwrap();
        let identity = store.get_chat_identity("zalo", "z-42").await.unwrap().unwrap();
        assert!(!identity.followed);
        assert_eq!(identity.uid.as_deref(), Some("u9"));
    }

    #[tokio::test]
    async fn viber_subscription_events_use_their_own_field_names() {
        let store: DynStore = Arc::new(MemoryStore::new());

        let subscribed = json!({ "event": "subscribed", "user": { "id": "v-7" } });
        ingest(&store, "viber", &subscribed).await.unwrap();
        assert!(store.get_chat_identity("viber", "v-7").await.unwrap().unwrap().followed);

        let unsubscribed = json!({ "event": "unsubscribed", "user_id": "v-7" });
        ingest(&store, "viber", &unsubscribed).await.unwrap();
        assert!(!store.get_chat_identity("viber", "v-7").await.unwrap().unwrap().followed);
    }

    #[tokio::test]
    async fn endpoint_answers_ok_even_for_garbage() {
        let (app, _ctx) = test_support::app(Arc::new(MemoryStore::new()));

        // No auth header and an unparseable body: still 200 {ok:true}.
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/webhooks/zalo")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed, json!({ "ok": true }));
    }
}
