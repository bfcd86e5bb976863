use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Extension, Path};
use axum::response::Json;

use courier_core::types::{Channel, WorkerRequest, WorkerResponse};
use courier_core::EngineError;
use courier_workers::Dispatcher;

use crate::error::ApiError;

/// `POST /api/v1/workers/{channel}`. One synchronous send attempt; the
/// verdict lands in the ledger either way.
pub async fn invoke(
    Extension(dispatcher): Extension<Arc<Dispatcher>>,
    Path(channel): Path<String>,
    body: Bytes,
) -> Result<Json<WorkerResponse>, ApiError> {
    let channel = Channel::parse(&channel)
        .ok_or_else(|| EngineError::validation(format!("unknown channel: {}", channel)))?;

    // Decoded by hand so a malformed body gets the shared error envelope
    // instead of an extractor rejection.
    let req: WorkerRequest = serde_json::from_slice(&body)
        .map_err(|e| EngineError::validation(format!("invalid worker request: {}", e)))?;

    let outcome = dispatcher.dispatch(channel, &req).await?;
    Ok(Json(WorkerResponse {
        ok: true,
        result: outcome.result,
        delivery_id: outcome.delivery_id,
    }))
}
