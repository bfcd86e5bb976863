use axum::body::Bytes;
use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use courier_core::kafka::produce_message;
use courier_core::redis::get_connection;
use courier_core::types::{Audience, Channel, JobStatus, NotificationJob};
use courier_core::{EngineContext, EngineError};

use crate::auth::{self, AuthenticatedUser};
use crate::error::ApiError;

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "courier-api"
    }))
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub expires_in_days: Option<u64>,
}

/// Dev/ops token minting. Anything that should not hold the JWT secret goes
/// through here.
pub async fn generate_token(
    Extension(ctx): Extension<EngineContext>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let req: TokenRequest = serde_json::from_slice(&body)
        .map_err(|e| EngineError::validation(format!("invalid token request: {}", e)))?;
    let uid = match req.uid {
        Some(u) if !u.is_empty() => u,
        _ => return Err(EngineError::validation("uid is required").into()),
    };

    let days = req.expires_in_days.unwrap_or(30);
    let token = auth::generate_token(&uid, &ctx.config.server.jwt_secret, days)?;
    Ok(Json(json!({ "token": token, "expires_in_days": days })))
}

/// All fields optional at the serde layer so absence reports through the
/// shared error envelope instead of a deserializer rejection.
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub audience: Option<Audience>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub required_channels: Option<Vec<String>>,
    #[serde(default)]
    pub topic: Option<String>,
}

/// `POST /api/v1/jobs`. Persists the job and produces the job-created
/// event; processing happens asynchronously in the orchestrator.
pub async fn create_job(
    Extension(ctx): Extension<EngineContext>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let req: CreateJobRequest = serde_json::from_slice(&body)
        .map_err(|e| EngineError::validation(format!("invalid job request: {}", e)))?;

    let template_id = match req.template_id {
        Some(t) if !t.is_empty() => t,
        _ => return Err(EngineError::validation("template_id is required").into()),
    };
    let audience = req
        .audience
        .ok_or_else(|| EngineError::validation("audience is required"))?;
    if audience.kind.is_empty() {
        return Err(EngineError::validation("audience.type is required").into());
    }

    let required_channels = match req.required_channels {
        Some(names) => {
            let mut channels = Vec::with_capacity(names.len());
            for name in &names {
                let channel = Channel::parse(name).ok_or_else(|| {
                    EngineError::validation(format!("unknown channel: {}", name))
                })?;
                channels.push(channel);
            }
            Some(channels)
        }
        None => None,
    };

    let now = Utc::now();
    let job = NotificationJob {
        id: Uuid::new_v4().to_string(),
        template_id,
        audience,
        data: req.data.unwrap_or_else(|| json!({})),
        required_channels,
        topic: req.topic,
        status: JobStatus::Created,
        status_reason: None,
        created_at: now,
        updated_at: now,
    };
    ctx.store.insert_job(&job).await?;

    let event = json!({ "event_type": "job.created", "job_id": job.id });
    produce_message(
        &ctx.kafka_producer,
        &ctx.config.kafka.jobs_topic,
        Some(&job.id),
        event.to_string().as_bytes(),
    )
    .await?;

    tracing::info!("Accepted job {} for template {}", job.id, job.template_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "id": job.id, "status": job.status.as_str() })),
    ))
}

pub async fn get_job(
    Extension(ctx): Extension<EngineContext>,
    Path(id): Path<String>,
) -> Result<Json<NotificationJob>, ApiError> {
    let job = ctx
        .store
        .get_job(&id)
        .await?
        .ok_or_else(|| EngineError::not_found(format!("job {}", id)))?;
    Ok(Json(job))
}

/// Operator view of a job's ledger rows, webhook audit trail included.
pub async fn get_job_deliveries(
    Extension(ctx): Extension<EngineContext>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if ctx.store.get_job(&id).await?.is_none() {
        return Err(EngineError::not_found(format!("job {}", id)).into());
    }
    let rows = ctx.store.list_deliveries_for_job(&id).await?;
    Ok(Json(json!({ "job_id": id, "deliveries": rows })))
}

#[derive(Debug, Deserialize)]
pub struct InboxQuery {
    pub uid: String,
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn get_inbox(
    Extension(ctx): Extension<EngineContext>,
    Query(params): Query<InboxQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = params.limit.unwrap_or(50).min(100);
    let items = ctx.store.list_inbox(&params.uid, limit).await?;
    Ok(Json(json!(items)))
}

/// `POST /api/v1/inbox/{id}/read`. The owning uid comes from the JWT; the
/// unread counter only moves when this call was the unread-to-read
/// transition.
pub async fn mark_inbox_read(
    Extension(ctx): Extension<EngineContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let updated = ctx.store.mark_inbox_read(&user.uid, &id).await?;

    if updated {
        match get_connection(&ctx.redis_pool).await {
            Ok(mut conn) => {
                let _: Result<i64, _> = redis::cmd("DECR")
                    .arg(format!("UNREAD:{}", user.uid))
                    .query_async(&mut conn)
                    .await;
            }
            Err(e) => {
                tracing::warn!("Unread counter not decremented for {}: {}", user.uid, e);
            }
        }
    }

    Ok(Json(json!({ "ok": true, "updated": updated })))
}

#[derive(Debug, Deserialize)]
pub struct InboxCountQuery {
    pub uid: String,
}

pub async fn get_inbox_counts(
    Extension(ctx): Extension<EngineContext>,
    Query(params): Query<InboxCountQuery>,
) -> Result<Json<Value>, ApiError> {
    if let Some(count) = cached_unread(&ctx, &params.uid).await {
        return Ok(Json(json!({ "unread": count.max(0) })));
    }
    let count = ctx.store.unread_inbox_count(&params.uid).await?;
    Ok(Json(json!({ "unread": count })))
}

/// Counter cache lookup. Any Redis trouble falls back to the store count.
async fn cached_unread(ctx: &EngineContext, uid: &str) -> Option<i64> {
    let mut conn = get_connection(&ctx.redis_pool).await.ok()?;
    redis::cmd("GET")
        .arg(format!("UNREAD:{}", uid))
        .query_async::<Option<i64>>(&mut conn)
        .await
        .ok()
        .flatten()
}
