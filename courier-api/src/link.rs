use axum::body::Bytes;
use axum::extract::Extension;
use axum::http::HeaderMap;
use axum::response::Json;
use chrono::{Duration, Utc};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};

use courier_core::store::{LinkRedemption, PreferenceSeed};
use courier_core::types::LinkCode;
use courier_core::{EngineContext, EngineError};

use crate::auth::AuthenticatedUser;
use crate::error::ApiError;
use crate::webhooks::record_follow_state;

/// Characters a user has to copy into a chat by hand; 0/O and 1/I are left
/// out.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

const MAX_CODE_ATTEMPTS: usize = 5;

#[derive(Debug, Deserialize)]
pub struct IssueCodeRequest {
    #[serde(default)]
    pub length: Option<usize>,
}

/// `POST /api/v1/link/codes`. The uid comes from the JWT; the body is
/// optional and may only adjust the code length.
pub async fn issue_code(
    Extension(ctx): Extension<EngineContext>,
    Extension(user): Extension<AuthenticatedUser>,
    body: Option<Json<IssueCodeRequest>>,
) -> Result<Json<Value>, ApiError> {
    let requested = body
        .and_then(|Json(req)| req.length)
        .unwrap_or(ctx.config.dispatch.link_code_length);
    let length = requested.clamp(4, 12);

    let now = Utc::now();
    let expires_at = now + Duration::minutes(ctx.config.dispatch.link_code_ttl_minutes);

    for _ in 0..MAX_CODE_ATTEMPTS {
        let code = random_code(length);
        let record = LinkCode {
            code: code.clone(),
            uid: user.uid.clone(),
            created_at: now,
            expires_at,
            used: false,
            used_at: None,
            used_by_external_id: None,
        };
        if ctx.store.insert_link_code(&record).await? {
            return Ok(Json(json!({
                "code": code,
                "expiresAtMs": expires_at.timestamp_millis(),
            })));
        }
    }

    Err(EngineError::exhausted("could not allocate a unique link code").into())
}

fn random_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkEventRequest {
    pub action: String,
    pub external_user_id: String,
    #[serde(default)]
    pub code: Option<String>,
    /// Which chat platform the bot speaks for. Absent in the original Zalo
    /// bot's payloads, so that is the default.
    #[serde(default)]
    pub provider: Option<String>,
}

/// `POST /api/v1/link/events`, called by the chat bots with a shared
/// secret. Handles follow-state changes and code redemption.
pub async fn link_event(
    Extension(ctx): Extension<EngineContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let presented = headers
        .get("x-courier-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented != ctx.config.server.link_events_secret {
        return Err(EngineError::unauthorized("bad link event secret").into());
    }

    let req: LinkEventRequest = serde_json::from_slice(&body)
        .map_err(|e| EngineError::validation(format!("invalid link event: {}", e)))?;
    if req.external_user_id.is_empty() {
        return Err(EngineError::validation("externalUserId is required").into());
    }
    let provider = req.provider.as_deref().unwrap_or("zalo");
    let now = Utc::now();

    match req.action.as_str() {
        "follow" | "unfollow" => {
            let followed = req.action == "follow";
            record_follow_state(&ctx.store, provider, &req.external_user_id, followed, now)
                .await?;
            Ok(Json(json!({ "ok": true })))
        }
        "link" => {
            let code = req
                .code
                .as_deref()
                .unwrap_or_default()
                .trim()
                .to_ascii_uppercase();
            if code.is_empty() {
                return Err(EngineError::validation("code is required for link").into());
            }
            let seed = PreferenceSeed {
                language: ctx.config.dispatch.default_language.clone(),
                timezone: ctx.config.dispatch.default_timezone.clone(),
            };
            let outcome = ctx
                .store
                .redeem_link_code(provider, &req.external_user_id, &code, &seed, now)
                .await?;
            match outcome {
                LinkRedemption::Linked { uid } => {
                    tracing::info!("Linked {} identity {} to {}", provider, req.external_user_id, uid);
                    Ok(Json(json!({ "ok": true, "uid": uid })))
                }
                LinkRedemption::NotFound => {
                    Err(EngineError::not_found("unknown link code").into())
                }
                LinkRedemption::Expired => Err(EngineError::gone("link code expired").into()),
                LinkRedemption::AlreadyUsed => {
                    Err(EngineError::conflict("link code already used").into())
                }
            }
        }
        other => Err(EngineError::validation(format!("unknown action: {}", other)).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use courier_core::store::{DynStore, MemoryStore};
    use std::sync::Arc;
    use tower::ServiceExt;

    use crate::test_support;

    fn code_request(length: Option<usize>) -> Request<Body> {
        let body = match length {
            Some(n) => Body::from(json!({ "length": n }).to_string()),
            None => Body::empty(),
        };
        Request::builder()
            .method("POST")
            .uri("/api/v1/link/codes")
            .header("authorization", test_support::bearer("u1"))
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }

    fn event_request(secret: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/link/events")
            .header("x-courier-secret", secret)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn codes_only_use_the_unambiguous_alphabet() {
        let code = random_code(12);
        assert_eq!(code.len(), 12);
        for c in code.bytes() {
            assert!(CODE_ALPHABET.contains(&c), "unexpected character {}", c as char);
        }
    }

    #[tokio::test]
    async fn issued_codes_can_be_redeemed_exactly_once() {
        let store: DynStore = Arc::new(MemoryStore::new());
        let (app, _ctx) = test_support::app(store.clone());

        let response = app.clone().oneshot(code_request(None)).await.unwrap();
        assert_eq!(response.status(), 200);
        let issued = json_body(response).await;
        let code = issued["code"].as_str().unwrap().to_string();
        assert_eq!(code.len(), 6);
        assert!(issued["expiresAtMs"].as_i64().unwrap() > Utc::now().timestamp_millis());

        let link = json!({ "action": "link", "externalUserId": "z-1", "code": code });
        let response = app
            .clone()
            .oneshot(event_request("test-link-secret", link.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body = json_body(response).await;
        assert_eq!(body["uid"], "u1");

        let identity = store.get_chat_identity("zalo", "z-1").await.unwrap().unwrap();
        assert_eq!(identity.uid.as_deref(), Some("u1"));
        assert!(identity.followed);
        let pref = store.get_preference("u1").await.unwrap().unwrap();
        assert_eq!(pref.contact.zalo_user_id.as_deref(), Some("z-1"));

        // Second redemption of the same code conflicts.
        let response = app
            .oneshot(event_request("test-link-secret", link))
            .await
            .unwrap();
        assert_eq!(response.status(), 409);
        let body = json_body(response).await;
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"]["code"], "conflict");
    }

    #[tokio::test]
    async fn expired_codes_answer_gone_even_when_unused() {
        let store: DynStore = Arc::new(MemoryStore::new());
        let (app, _ctx) = test_support::app(store.clone());

        let record = LinkCode {
            code: "OLDCODE".to_string(),
            uid: "u1".to_string(),
            created_at: Utc::now() - Duration::minutes(30),
            expires_at: Utc::now() - Duration::minutes(20),
            used: false,
            used_at: None,
            used_by_external_id: None,
        };
        assert!(store.insert_link_code(&record).await.unwrap());

        // Lowercase with whitespace: the handler normalizes before lookup.
        let event = json!({ "action": "link", "externalUserId": "z-2", "code": " oldcode " });
        let response = app
            .oneshot(event_request("test-link-secret", event))
            .await
            .unwrap();
        assert_eq!(response.status(), 410);
    }

    #[tokio::test]
    async fn unknown_codes_and_actions_are_rejected() {
        let (app, _ctx) = test_support::app(Arc::new(MemoryStore::new()));

        let event = json!({ "action": "link", "externalUserId": "z-3", "code": "NOSUCH1" });
        let response = app
            .clone()
            .oneshot(event_request("test-link-secret", event))
            .await
            .unwrap();
        assert_eq!(response.status(), 404);

        let event = json!({ "action": "shout", "externalUserId": "z-3" });
        let response = app
            .oneshot(event_request("test-link-secret", event))
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn wrong_shared_secret_is_unauthorized() {
        let (app, _ctx) = test_support::app(Arc::new(MemoryStore::new()));

        let event = json!({ "action": "follow", "externalUserId": "z-4" });
        let response = app
            .oneshot(event_request("wrong-secret", event))
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
    }

    #[tokio::test]
    async fn follow_events_record_the_identity() {
        let store: DynStore = Arc::new(MemoryStore::new());
        let (app, _ctx) = test_support::app(store.clone());

        let event = json!({ "action": "follow", "externalUserId": "v-5", "provider": "viber" });
        let response = app
            .oneshot(event_request("test-link-secret", event))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let identity = store.get_chat_identity("viber", "v-5").await.unwrap().unwrap();
        assert!(identity.followed);
        assert_eq!(identity.uid, None);
    }

    #[tokio::test]
    async fn requested_length_is_clamped() {
        let (app, _ctx) = test_support::app(Arc::new(MemoryStore::new()));

        let response = app.clone().oneshot(code_request(Some(2))).await.unwrap();
        assert_eq!(json_body(response).await["code"].as_str().unwrap().len(), 4);

        let response = app.oneshot(code_request(Some(40))).await.unwrap();
        assert_eq!(json_body(response).await["code"].as_str().unwrap().len(), 12);
    }

    #[tokio::test]
    async fn issuing_requires_a_token() {
        let (app, _ctx) = test_support::app(Arc::new(MemoryStore::new()));

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/link/codes")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), 401);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "unauthorized");
    }
}
