use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use courier_core::config::ProviderConfig;
use courier_core::types::{MessagePayload, ProviderResult, SendContext, SendTarget};

use crate::{read_body, ProviderAdapter};

#[derive(Debug, Serialize)]
struct ViberMessageRequest<'a> {
    receiver: &'a str,
    min_api_version: u8,
    sender: ViberSender<'a>,
    #[serde(rename = "type")]
    message_type: &'static str,
    text: String,
}

#[derive(Debug, Serialize)]
struct ViberSender<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct ViberResponse {
    status: i64,
    #[serde(default)]
    status_message: Option<String>,
    #[serde(default)]
    message_token: Option<u64>,
}

pub struct ViberAdapter {
    client: reqwest::Client,
    auth_token: Option<String>,
    sender_name: String,
    api_base: String,
}

impl ViberAdapter {
    pub fn new(config: &ProviderConfig, client: reqwest::Client) -> Self {
        if config.viber_auth_token.is_none() {
            tracing::warn!("Viber delivery disabled (missing bot token)");
        }
        Self {
            client,
            auth_token: config.viber_auth_token.clone(),
            sender_name: config
                .viber_sender_name
                .clone()
                .unwrap_or_else(|| "notifications".to_string()),
            api_base: config.viber_api_base.clone(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for ViberAdapter {
    fn name(&self) -> &'static str {
        "viber"
    }

    async fn send(
        &self,
        target: &SendTarget,
        payload: &MessagePayload,
        ctx: &SendContext,
    ) -> Result<ProviderResult> {
        let Some(auth_token) = &self.auth_token else {
            return Ok(ProviderResult::skipped("viber", "not_configured"));
        };
        let SendTarget::Chat { external_user_id } = target else {
            return Ok(ProviderResult::failed(
                "viber",
                "invalid_target",
                "chat target required",
            ));
        };
        if external_user_id.is_empty() {
            return Ok(ProviderResult::skipped("viber", "no_target"));
        }

        let mut text = format!("{}\n{}", payload.title, payload.body);
        if let Some(url) = &payload.action_url {
            text.push('\n');
            text.push_str(url);
        }

        tracing::debug!("Sending Viber message for job {}", ctx.job_id);

        let response = self
            .client
            .post(format!("{}/send_message", self.api_base))
            .header("X-Viber-Auth-Token", auth_token)
            .json(&ViberMessageRequest {
                receiver: external_user_id,
                min_api_version: 1,
                sender: ViberSender {
                    name: &self.sender_name,
                },
                message_type: "text",
                text,
            })
            .send()
            .await?;
        let (status, body) = read_body("viber", response).await?;
        if !status.is_success() {
            return Ok(ProviderResult::failed(
                "viber",
                format!("viber_http_{}", status.as_u16()),
                body,
            ));
        }

        let parsed: ViberResponse = serde_json::from_str(&body)
            .map_err(|e| anyhow!("viber returned unparseable body: {}", e))?;
        if parsed.status != 0 {
            return Ok(ProviderResult::failed(
                "viber",
                format!("viber_{}", parsed.status),
                parsed.status_message.unwrap_or_default(),
            ));
        }

        Ok(ProviderResult::sent(
            "viber",
            parsed.message_token.map(|t| t.to_string()),
        ))
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

    fn chat_target(id: &str) -> SendTarget {
        SendTarget::Chat {
            external_user_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn zero_status_is_sent_with_message_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/viber/send_message"))
            .and(header("X-Viber-Auth-Token", "viber-test-token"))
            .and(body_partial_json(json!({"receiver": "v-7", "type": "text"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": 0,
                "status_message": "ok",
                "message_token": 5098034272017990493u64
            })))
            .mount(&server)
            .await;

        let adapter = ViberAdapter::new(&provider_config(&server.uri()), reqwest::Client::new());
        let result = adapter
            .send(&chat_target("v-7"), &payload(), &ctx())
            .await
            .unwrap();

        assert_eq!(result.status, SendStatus::Sent);
        assert_eq!(
            result.provider_message_id.as_deref(),
            Some("5098034272017990493")
        );
    }

    #[tokio::test]
    async fn nonzero_status_is_a_terminal_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/viber/send_message"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": 6,
                "status_message": "notSubscribed"
            })))
            .mount(&server)
            .await;

        let adapter = ViberAdapter::new(&provider_config(&server.uri()), reqwest::Client::new());
        let result = adapter
            .send(&chat_target("v-7"), &payload(), &ctx())
            .await
            .unwrap();

        assert_eq!(result.status, SendStatus::Failed);
        assert_eq!(result.error_code.as_deref(), Some("viber_6"));
        assert_eq!(result.error_message.as_deref(), Some("notSubscribed"));
    }

    #[tokio::test]
    async fn missing_token_skips() {
        let mut config = provider_config("http://unused.test");
        config.viber_auth_token = None;
        let adapter = ViberAdapter::new(&config, reqwest::Client::new());
        let result = adapter
            .send(&chat_target("v-7"), &payload(), &ctx())
            .await
            .unwrap();

        assert_eq!(result.status, SendStatus::Skipped);
        assert_eq!(result.error_code.as_deref(), Some("not_configured"));
    }
}
