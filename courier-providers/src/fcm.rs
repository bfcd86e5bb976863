use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use courier_core::config::ProviderConfig;
use courier_core::types::{MessagePayload, ProviderResult, SendContext, SendTarget};

use crate::{read_body, ProviderAdapter};

#[derive(Debug, Serialize)]
struct FcmMessage<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    registration_ids: Option<&'a [String]>,
    notification: FcmNotification<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

#[derive(Debug, Serialize)]
struct FcmNotification<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct FcmResponse {
    #[serde(default)]
    success: i64,
    #[serde(default)]
    failure: i64,
    #[serde(default)]
    results: Vec<FcmSendResult>,
    // Topic sends answer with a bare numeric message id instead.
    #[serde(default)]
    message_id: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FcmSendResult {
    message_id: Option<String>,
    error: Option<String>,
}

pub struct FcmAdapter {
    client: reqwest::Client,
    server_key: Option<String>,
    api_base: String,
}

impl FcmAdapter {
    pub fn new(config: &ProviderConfig, client: reqwest::Client) -> Self {
        if config.fcm_server_key.is_none() {
            tracing::warn!("Push delivery disabled (missing FCM configuration)");
        }
        Self {
            client,
            server_key: config.fcm_server_key.clone(),
            api_base: config.fcm_api_base.clone(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for FcmAdapter {
    fn name(&self) -> &'static str {
        "fcm"
    }

    async fn send(
        &self,
        target: &SendTarget,
        payload: &MessagePayload,
        ctx: &SendContext,
    ) -> Result<ProviderResult> {
        let Some(server_key) = &self.server_key else {
            return Ok(ProviderResult::skipped("fcm", "not_configured"));
        };
        let SendTarget::Push { tokens, topic } = target else {
            return Ok(ProviderResult::failed(
                "fcm",
                "invalid_target",
                "push target required",
            ));
        };

        let mut message = FcmMessage {
            to: None,
            registration_ids: None,
            notification: FcmNotification {
                title: &payload.title,
                body: &payload.body,
            },
            data: payload
                .action_url
                .as_ref()
                .map(|url| serde_json::json!({ "actionUrl": url })),
        };

        // Addressing modes in priority order: multicast, topic, single token.
        if tokens.len() > 1 {
            message.registration_ids = Some(tokens);
        } else if let Some(topic) = topic {
            message.to = Some(format!("/topics/{}", topic));
        } else if let Some(token) = tokens.first() {
            message.to = Some(token.clone());
        } else {
            return Ok(ProviderResult::skipped("fcm", "no_target"));
        }

        tracing::debug!("Sending push for job {}", ctx.job_id);

        let response = self
            .client
            .post(format!("{}/send", self.api_base))
            .header("Authorization", format!("key={}", server_key))
            .json(&message)
            .send()
            .await?;
        let (status, body) = read_body("fcm", response).await?;
        if !status.is_success() {
            return Ok(ProviderResult::failed(
                "fcm",
                format!("fcm_{}", status.as_u16()),
                body,
            ));
        }

        let parsed: FcmResponse = serde_json::from_str(&body)
            .map_err(|e| anyhow!("fcm returned unparseable body: {}", e))?;

        if let Some(error) = parsed.error {
            return Ok(ProviderResult::failed("fcm", "fcm_error", error));
        }
        if let Some(id) = parsed.message_id {
            let id = match id {
                Value::String(s) => s,
                other => other.to_string(),
            };
            return Ok(ProviderResult::sent("fcm", Some(id)));
        }
        if parsed.success > 0 {
            let first_id = parsed.results.iter().find_map(|r| r.message_id.clone());
            return Ok(ProviderResult::sent("fcm", first_id).with_meta(serde_json::json!({
                "success": parsed.success,
                "failure": parsed.failure,
            })));
        }

        let first_error = parsed
            .results
            .iter()
            .find_map(|r| r.error.clone())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(ProviderResult::failed("fcm", "fcm_error", first_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ctx, payload, provider_config};
    use courier_core::types::SendStatus;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn push_target(tokens: &[&str], topic: Option<&str>) -> SendTarget {
        SendTarget::Push {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            topic: topic.map(|t| t.to_string()),
        }
    }

    #[tokio::test]
    async fn multicast_counts_as_sent_when_any_token_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fcm/send"))
            .and(header("Authorization", "key=fcm-test-key"))
            .and(body_partial_json(json!({"registration_ids": ["tok-a", "tok-b"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": 1,
                "failure": 1,
                "results": [{"message_id": "m-1"}, {"error": "NotRegistered"}]
            })))
            .mount(&server)
            .await;

        let adapter = FcmAdapter::new(&provider_config(&server.uri()), reqwest::Client::new());
        let result = adapter
            .send(&push_target(&["tok-a", "tok-b"], None), &payload(), &ctx())
            .await
            .unwrap();

        assert_eq!(result.status, SendStatus::Sent);
        assert_eq!(result.provider_message_id.as_deref(), Some("m-1"));
        assert_eq!(result.meta.unwrap()["failure"], 1);
    }

    #[tokio::test]
    async fn all_tokens_failing_reports_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fcm/send"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": 0,
                "failure": 2,
                "results": [{"error": "NotRegistered"}, {"error": "InvalidRegistration"}]
            })))
            .mount(&server)
            .await;

        let adapter = FcmAdapter::new(&provider_config(&server.uri()), reqwest::Client::new());
        let result = adapter
            .send(&push_target(&["tok-a", "tok-b"], None), &payload(), &ctx())
            .await
            .unwrap();

        assert_eq!(result.status, SendStatus::Failed);
        assert_eq!(result.error_message.as_deref(), Some("NotRegistered"));
    }

    #[tokio::test]
    async fn topic_addressing_wins_over_a_single_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fcm/send"))
            .and(body_partial_json(json!({"to": "/topics/deals"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"message_id": 7253391})),
            )
            .mount(&server)
            .await;

        let adapter = FcmAdapter::new(&provider_config(&server.uri()), reqwest::Client::new());
        let result = adapter
            .send(&push_target(&["tok-a"], Some("deals")), &payload(), &ctx())
            .await
            .unwrap();

        assert_eq!(result.status, SendStatus::Sent);
        assert_eq!(result.provider_message_id.as_deref(), Some("7253391"));
    }

    #[tokio::test]
    async fn empty_target_is_skipped_without_calling_out() {
        let server = MockServer::start().await;
        let adapter = FcmAdapter::new(&provider_config(&server.uri()), reqwest::Client::new());
        let result = adapter
            .send(&push_target(&[], None), &payload(), &ctx())
            .await
            .unwrap();

        assert_eq!(result.status, SendStatus::Skipped);
        assert_eq!(result.error_code.as_deref(), Some("no_target"));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_configuration_skips() {
        let mut config = provider_config("http://unused.test");
        config.fcm_server_key = None;
        let adapter = FcmAdapter::new(&config, reqwest::Client::new());
        let result = adapter
            .send(&push_target(&["tok-a"], None), &payload(), &ctx())
            .await
            .unwrap();

        assert_eq!(result.status, SendStatus::Skipped);
        assert_eq!(result.error_code.as_deref(), Some("not_configured"));
    }

    #[tokio::test]
    async fn provider_outage_is_an_error_not_a_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fcm/send"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let adapter = FcmAdapter::new(&provider_config(&server.uri()), reqwest::Client::new());
        let outcome = adapter
            .send(&push_target(&["tok-a"], None), &payload(), &ctx())
            .await;

        assert!(outcome.is_err());
    }
}
