use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use courier_core::config::ProviderConfig;
use courier_core::types::{MessagePayload, ProviderResult, SendContext, SendTarget};

use crate::{read_body, ProviderAdapter};

/// Simple HTML escaping function
fn html_escape(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '<' => "&lt;".to_string(),
            '>' => "&gt;".to_string(),
            '&' => "&amp;".to_string(),
            '"' => "&quot;".to_string(),
            '\'' => "&#x27;".to_string(),
            _ => c.to_string(),
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct ResendEmailRequest {
    from: String,
    to: Vec<String>,
    subject: String,
    html: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResendEmailResponse {
    id: String,
}

pub struct EmailAdapter {
    client: reqwest::Client,
    api_key: Option<String>,
    from_email: Option<String>,
    api_base: String,
}

impl EmailAdapter {
    pub fn new(config: &ProviderConfig, client: reqwest::Client) -> Self {
        if config.resend_api_key.is_none() || config.resend_from_email.is_none() {
            tracing::warn!("Email delivery disabled (missing Resend configuration)");
        }
        Self {
            client,
            api_key: config.resend_api_key.clone(),
            from_email: config.resend_from_email.clone(),
            api_base: config.resend_api_base.clone(),
        }
    }

    fn render_html(payload: &MessagePayload) -> String {
        let action = payload
            .action_url
            .as_ref()
            .map(|url| {
                format!(
                    r#"<p style="margin: 16px 0 0 0;"><a href="{}" style="color: #0d6efd;">View details</a></p>"#,
                    html_escape(url)
                )
            })
            .unwrap_or_default();
        format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
</head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, 'Helvetica Neue', Arial, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <div style="background-color: #f8f9fa; border-radius: 8px; padding: 24px; margin-bottom: 20px;">
        <h1 style="margin: 0 0 16px 0; font-size: 24px; color: #212529;">{}</h1>
        <p style="margin: 0; font-size: 16px; color: #495057;">{}</p>{}
    </div>
</body>
</html>"#,
            html_escape(&payload.title),
            html_escape(&payload.body),
            action
        )
    }
}

#[async_trait]
impl ProviderAdapter for EmailAdapter {
    fn name(&self) -> &'static str {
        "resend"
    }

    async fn send(
        &self,
        target: &SendTarget,
        payload: &MessagePayload,
        ctx: &SendContext,
    ) -> Result<ProviderResult> {
        let (api_key, from_email) = match (&self.api_key, &self.from_email) {
            (Some(k), Some(f)) => (k, f),
            _ => return Ok(ProviderResult::skipped("resend", "not_configured")),
        };
        let SendTarget::Email { to } = target else {
            return Ok(ProviderResult::failed(
                "resend",
                "invalid_target",
                "email target required",
            ));
        };
        if to.is_empty() {
            return Ok(ProviderResult::skipped("resend", "no_target"));
        }

        let email_request = ResendEmailRequest {
            from: from_email.clone(),
            to: vec![to.clone()],
            subject: payload.title.clone(),
            html: Self::render_html(payload),
            text: Some(payload.body.clone()),
        };

        tracing::debug!("Sending email for job {}", ctx.job_id);

        let response = self
            .client
            .post(format!("{}/emails", self.api_base))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&email_request)
            .send()
            .await?;
        let (status, body) = read_body("resend", response).await?;
        if !status.is_success() {
            return Ok(ProviderResult::failed(
                "resend",
                format!("resend_{}", status.as_u16()),
                body,
            ));
        }

        let parsed: ResendEmailResponse = serde_json::from_str(&body)
            .map_err(|e| anyhow!("resend returned unparseable body: {}", e))?;
        Ok(ProviderResult::sent("resend", Some(parsed.id)))
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

    #[tokio::test]
    async fn successful_send_returns_message_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .and(header("Authorization", "Bearer resend-test-key"))
            .and(body_partial_json(json!({
                "to": ["an@example.com"],
                "subject": "Booking confirmed"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "re_123"})))
            .mount(&server)
            .await;

        let adapter = EmailAdapter::new(&provider_config(&server.uri()), reqwest::Client::new());
        let target = SendTarget::Email {
            to: "an@example.com".to_string(),
        };
        let result = adapter.send(&target, &payload(), &ctx()).await.unwrap();

        assert_eq!(result.status, SendStatus::Sent);
        assert_eq!(result.provider_message_id.as_deref(), Some("re_123"));
    }

    #[tokio::test]
    async fn rejected_address_is_a_terminal_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .respond_with(
                ResponseTemplate::new(422).set_body_string("{\"message\":\"invalid to\"}"),
            )
            .mount(&server)
            .await;

        let adapter = EmailAdapter::new(&provider_config(&server.uri()), reqwest::Client::new());
        let target = SendTarget::Email {
            to: "not-an-address".to_string(),
        };
        let result = adapter.send(&target, &payload(), &ctx()).await.unwrap();

        assert_eq!(result.status, SendStatus::Failed);
        assert_eq!(result.error_code.as_deref(), Some("resend_422"));
    }

    #[tokio::test]
    async fn missing_address_skips() {
        let adapter = EmailAdapter::new(
            &provider_config("http://unused.test"),
            reqwest::Client::new(),
        );
        let target = SendTarget::Email { to: String::new() };
        let result = adapter.send(&target, &payload(), &ctx()).await.unwrap();

        assert_eq!(result.status, SendStatus::Skipped);
        assert_eq!(result.error_code.as_deref(), Some("no_target"));
    }

    #[test]
    fn html_is_escaped() {
        let rendered = EmailAdapter::render_html(&MessagePayload {
            title: "<b>Hi</b>".to_string(),
            body: "a & b".to_string(),
            action_url: None,
        });
        assert!(rendered.contains("&lt;b&gt;Hi&lt;/b&gt;"));
        assert!(rendered.contains("a &amp; b"));
    }
}
