use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use courier_core::config::ProviderConfig;
use courier_core::store::DynStore;
use courier_core::types::{MessagePayload, ProviderResult, SendContext, SendTarget};

use crate::{read_body, ProviderAdapter};

#[derive(Debug, Serialize)]
struct ZaloMessageRequest<'a> {
    recipient: ZaloRecipient<'a>,
    message: ZaloText,
}

#[derive(Debug, Serialize)]
struct ZaloRecipient<'a> {
    user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct ZaloText {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ZaloResponse {
    error: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// Zalo Official Account messages. The access token is the stored singleton
/// maintained by the credential refresher; this adapter only reads it.
pub struct ZaloAdapter {
    client: reqwest::Client,
    api_base: String,
    store: DynStore,
}

impl ZaloAdapter {
    pub fn new(config: &ProviderConfig, client: reqwest::Client, store: DynStore) -> Self {
        if config.zalo_app_id.is_none() {
            tracing::warn!("Zalo delivery disabled (missing app configuration)");
        }
        Self {
            client,
            api_base: config.zalo_api_base.clone(),
            store,
        }
    }
}

#[async_trait]
impl ProviderAdapter for ZaloAdapter {
    fn name(&self) -> &'static str {
        "zalo"
    }

    async fn send(
        &self,
        target: &SendTarget,
        payload: &MessagePayload,
        ctx: &SendContext,
    ) -> Result<ProviderResult> {
        let SendTarget::Chat { external_user_id } = target else {
            return Ok(ProviderResult::failed(
                "zalo",
                "invalid_target",
                "chat target required",
            ));
        };
        if external_user_id.is_empty() {
            return Ok(ProviderResult::skipped("zalo", "no_target"));
        }

        let access_token = match self.store.get_oauth_token("zalo").await? {
            Some(record) => match record.access_token {
                Some(token) => token,
                None => return Ok(ProviderResult::skipped("zalo", "no_token")),
            },
            None => return Ok(ProviderResult::skipped("zalo", "no_token")),
        };

        let mut text = format!("{}\n{}", payload.title, payload.body);
        if let Some(url) = &payload.action_url {
            text.push('\n');
            text.push_str(url);
        }

        tracing::debug!("Sending Zalo message for job {}", ctx.job_id);

        let response = self
            .client
            .post(format!("{}/message/cs", self.api_base))
            .header("access_token", &access_token)
            .json(&ZaloMessageRequest {
                recipient: ZaloRecipient {
                    user_id: external_user_id,
                },
                message: ZaloText { text },
            })
            .send()
            .await?;
        let (status, body) = read_body("zalo", response).await?;
        if !status.is_success() {
            return Ok(ProviderResult::failed(
                "zalo",
                format!("zalo_http_{}", status.as_u16()),
                body,
            ));
        }

        let parsed: ZaloResponse = serde_json::from_str(&body)
            .map_err(|e| anyhow!("zalo returned unparseable body: {}", e))?;
        if parsed.error != 0 {
            return Ok(ProviderResult::failed(
                "zalo",
                format!("zalo_{}", parsed.error),
                parsed.message.unwrap_or_default(),
            ));
        }

        let message_id = parsed
            .data
            .as_ref()
            .and_then(|d| d.get("message_id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Ok(ProviderResult::sent("zalo", message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ctx, payload, provider_config};
    use chrono::Utc;
    use courier_core::store::{MemoryStore, Store};
    use courier_core::types::{OAuthTokenRecord, SendStatus};
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn store_with_token(token: Option<&str>) -> DynStore {
        let store = MemoryStore::new();
        if let Some(token) = token {
            store
                .upsert_oauth_token(&OAuthTokenRecord {
                    provider: "zalo".to_string(),
                    access_token: Some(token.to_string()),
                    refresh_token: Some("refresh".to_string()),
                    expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
                    updated_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        Arc::new(store)
    }

    fn chat_target(id: &str) -> SendTarget {
        SendTarget::Chat {
            external_user_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn sends_with_stored_access_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/zalo/message/cs"))
            .and(header("access_token", "tok-abc"))
            .and(body_partial_json(json!({"recipient": {"user_id": "z-9"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": 0,
                "message": "Success",
                "data": {"message_id": "zm-1"}
            })))
            .mount(&server)
            .await;

        let adapter = ZaloAdapter::new(
            &provider_config(&server.uri()),
            reqwest::Client::new(),
            store_with_token(Some("tok-abc")).await,
        );
        let result = adapter
            .send(&chat_target("z-9"), &payload(), &ctx())
            .await
            .unwrap();

        assert_eq!(result.status, SendStatus::Sent);
        assert_eq!(result.provider_message_id.as_deref(), Some("zm-1"));
    }

    #[tokio::test]
    async fn provider_error_code_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/zalo/message/cs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": -216,
                "message": "Access token is invalid"
            })))
            .mount(&server)
            .await;

        let adapter = ZaloAdapter::new(
            &provider_config(&server.uri()),
            reqwest::Client::new(),
            store_with_token(Some("tok-stale")).await,
        );
        let result = adapter
            .send(&chat_target("z-9"), &payload(), &ctx())
            .await
            .unwrap();

        assert_eq!(result.status, SendStatus::Failed);
        assert_eq!(result.error_code.as_deref(), Some("zalo_-216"));
    }

    #[tokio::test]
    async fn missing_token_skips_without_calling_out() {
        let server = MockServer::start().await;
        let adapter = ZaloAdapter::new(
            &provider_config(&server.uri()),
            reqwest::Client::new(),
            store_with_token(None).await,
        );
        let result = adapter
            .send(&chat_target("z-9"), &payload(), &ctx())
            .await
            .unwrap();

        assert_eq!(result.status, SendStatus::Skipped);
        assert_eq!(result.error_code.as_deref(), Some("no_token"));
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
