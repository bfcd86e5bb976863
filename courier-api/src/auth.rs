use anyhow::anyhow;
use axum::{extract::Request, http::header::AUTHORIZATION, response::Response};
use courier_core::{EngineContext, EngineError};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ApiError;

/// JWT claims: `sub` carries the marketplace uid.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Inserted into request extensions by the middleware for handlers that
/// need the caller's uid.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub uid: String,
}

fn extract_token(auth_header: Option<&str>) -> Option<String> {
    auth_header?
        .strip_prefix("Bearer ")
        .map(|s| s.trim().to_string())
}

pub fn generate_token(uid: &str, secret: &str, expires_in_days: u64) -> anyhow::Result<String> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as usize;
    let exp = now + (expires_in_days * 24 * 60 * 60) as usize;

    let claims = Claims {
        sub: uid.to_string(),
        exp,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_ref()),
    )?;
    Ok(token)
}

pub fn verify_token(token: &str, secret: &str) -> Result<String, EngineError> {
    let decoding_key = DecodingKey::from_secret(secret.as_ref());
    match decode::<Claims>(token, &decoding_key, &Validation::default()) {
        Ok(data) => Ok(data.claims.sub),
        Err(e) => {
            tracing::debug!("JWT verification failed: {}", e);
            Err(EngineError::unauthorized("invalid token"))
        }
    }
}

/// Routes the provider platforms call directly carry their own shared
/// secrets instead of a user JWT.
fn skips_auth(path: &str) -> bool {
    path == "/health"
        || path == "/api/v1/auth/token"
        || path.starts_with("/api/v1/webhooks/")
        || path == "/api/v1/link/events"
}

pub async fn auth_middleware(
    mut req: Request,
    next: axum::middleware::Next,
) -> Result<Response, ApiError> {
    let path = req.uri().path();
    if skips_auth(path) {
        return Ok(next.run(req).await);
    }

    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = extract_token(auth_header)
        .ok_or_else(|| EngineError::unauthorized("missing bearer token"))?;

    let ctx = req
        .extensions()
        .get::<EngineContext>()
        .ok_or_else(|| EngineError::Internal(anyhow!("context missing from request")))?;

    let uid = verify_token(&token, &ctx.config.server.jwt_secret)?;
    req.extensions_mut().insert(AuthenticatedUser { uid });

    Ok(next.run(req).await)
}
