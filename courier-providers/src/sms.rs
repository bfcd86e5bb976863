use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use courier_core::config::ProviderConfig;
use courier_core::types::{MessagePayload, ProviderResult, SendContext, SendTarget};

use crate::{read_body, ProviderAdapter};

#[derive(Debug, Serialize)]
struct SmsRequest<'a> {
    to: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<&'a str>,
    text: String,
}

#[derive(Debug, Deserialize, Default)]
struct SmsResponse {
    #[serde(default, alias = "message_id")]
    id: Option<String>,
}

/// Adapter for a plain JSON SMS gateway: one POST, bearer auth, an id in the
/// response when the gateway assigns one.
pub struct SmsAdapter {
    client: reqwest::Client,
    gateway_url: Option<String>,
    api_key: Option<String>,
    sender_id: Option<String>,
}

impl SmsAdapter {
    pub fn new(config: &ProviderConfig, client: reqwest::Client) -> Self {
        if config.sms_gateway_url.is_none() {
            tracing::warn!("SMS delivery disabled (missing gateway configuration)");
        }
        Self {
            client,
            gateway_url: config.sms_gateway_url.clone(),
            api_key: config.sms_api_key.clone(),
            sender_id: config.sms_sender_id.clone(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for SmsAdapter {
    fn name(&self) -> &'static str {
        "sms"
    }

    async fn send(
        &self,
        target: &SendTarget,
        payload: &MessagePayload,
        ctx: &SendContext,
    ) -> Result<ProviderResult> {
        let Some(gateway_url) = &self.gateway_url else {
            return Ok(ProviderResult::skipped("sms", "not_configured"));
        };
        let SendTarget::Sms { to } = target else {
            return Ok(ProviderResult::failed(
                "sms",
                "invalid_target",
                "sms target required",
            ));
        };
        if to.is_empty() {
            return Ok(ProviderResult::skipped("sms", "no_target"));
        }

        // SMS has no title line; prepend it when present.
        let text = if payload.title.is_empty() {
            payload.body.clone()
        } else {
            format!("{}\n{}", payload.title, payload.body)
        };

        tracing::debug!("Sending SMS for job {}", ctx.job_id);

        let mut request = self.client.post(gateway_url).json(&SmsRequest {
            to,
            from: self.sender_id.as_deref(),
            text,
        });
        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request.send().await?;
        let (status, body) = read_body("sms", response).await?;
        if !status.is_success() {
            return Ok(ProviderResult::failed(
                "sms",
                format!("sms_{}", status.as_u16()),
                body,
            ));
        }

        let parsed: SmsResponse = serde_json::from_str(&body).unwrap_or_default();
        Ok(ProviderResult::sent("sms", parsed.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ctx, payload, provider_config};
    use courier_core::types::SendStatus;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn sends_title_and_body_as_one_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sms"))
            .and(body_partial_json(json!({
                "to": "+84900000001",
                "from": "RENTALS",
                "text": "Booking confirmed\nYour camera is ready for pickup"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "sms-9"})))
            .mount(&server)
            .await;

        let adapter = SmsAdapter::new(&provider_config(&server.uri()), reqwest::Client::new());
        let target = SendTarget::Sms {
            to: "+84900000001".to_string(),
        };
        let result = adapter.send(&target, &payload(), &ctx()).await.unwrap();

        assert_eq!(result.status, SendStatus::Sent);
        assert_eq!(result.provider_message_id.as_deref(), Some("sms-9"));
    }

    #[tokio::test]
    async fn gateway_without_id_still_counts_as_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sms"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let adapter = SmsAdapter::new(&provider_config(&server.uri()), reqwest::Client::new());
        let target = SendTarget::Sms {
            to: "+84900000001".to_string(),
        };
        let result = adapter.send(&target, &payload(), &ctx()).await.unwrap();

        assert_eq!(result.status, SendStatus::Sent);
        assert!(result.provider_message_id.is_none());
    }

    #[tokio::test]
    async fn unconfigured_gateway_skips() {
        let mut config = provider_config("http://unused.test");
        config.sms_gateway_url = None;
        let adapter = SmsAdapter::new(&config, reqwest::Client::new());
        let target = SendTarget::Sms {
            to: "+84900000001".to_string(),
        };
        let result = adapter.send(&target, &payload(), &ctx()).await.unwrap();

        assert_eq!(result.status, SendStatus::Skipped);
        assert_eq!(result.error_code.as_deref(), Some("not_configured"));
    }
}
