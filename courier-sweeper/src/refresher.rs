use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use courier_core::config::{ProviderConfig, RefreshConfig};
use courier_core::context::EngineContext;
use courier_core::store::DynStore;
use courier_core::types::OAuthTokenRecord;

/// Zalo rotates access tokens roughly daily and invalidates the refresh
/// token on every use, so the exchange is driven proactively off the stored
/// expiry instead of reacting to 401s mid-send.
pub struct Refresher {
    client: reqwest::Client,
    store: DynStore,
    providers: ProviderConfig,
    refresh: RefreshConfig,
}

#[derive(Debug, Deserialize)]
struct ZaloRefreshResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    // Zalo sends this as a string; tolerate a number as well.
    #[serde(default)]
    expires_in: Option<Value>,
    #[serde(default)]
    error: Option<i64>,
    #[serde(default)]
    error_name: Option<String>,
}

pub async fn run(ctx: EngineContext) -> Result<()> {
    tracing::info!("Starting credential refresher");

    let refresher = Refresher::new(
        ctx.store.clone(),
        ctx.config.providers.clone(),
        ctx.config.refresh.clone(),
    );
    let interval = Duration::from_secs(ctx.config.refresh.interval_secs.max(1));

    loop {
        match refresher.refresh_zalo(Utc::now()).await {
            Ok(true) => tracing::info!("Zalo access token refreshed"),
            Ok(false) => {}
            Err(e) => tracing::error!("Error refreshing Zalo credentials: {}", e),
        }
        tokio::time::sleep(interval).await;
    }
}

impl Refresher {
    pub fn new(store: DynStore, providers: ProviderConfig, refresh: RefreshConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            store,
            providers,
            refresh,
        }
    }

    /// One refresh decision. Returns true when a new token was stored.
    pub async fn refresh_zalo(&self, now: DateTime<Utc>) -> Result<bool> {
        let Some(record) = self.store.get_oauth_token("zalo").await? else {
            return Ok(false);
        };
        let Some(refresh_token) = record.refresh_token.clone().filter(|t| !t.is_empty()) else {
            return Ok(false);
        };
        if !self.needs_refresh(&record, now) {
            return Ok(false);
        }
        let (Some(app_id), Some(secret_key)) = (
            self.providers.zalo_app_id.as_deref(),
            self.providers.zalo_secret_key.as_deref(),
        ) else {
            tracing::warn!("Zalo refresh token present but app credentials are not configured");
            return Ok(false);
        };

        tracing::info!("Refreshing Zalo access token");
        let response = self
            .client
            .post(format!("{}/access_token", self.providers.zalo_oauth_base))
            .header("secret_key", secret_key)
            .form(&[
                ("app_id", app_id),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("zalo oauth returned {}: {}", status, body);
        }

        let parsed: ZaloRefreshResponse = serde_json::from_str(&body)?;
        if let Some(error) = parsed.error.filter(|e| *e != 0) {
            bail!(
                "zalo oauth rejected the refresh: {} {}",
                error,
                parsed.error_name.unwrap_or_default()
            );
        }
        let Some(access_token) = parsed.access_token.filter(|t| !t.is_empty()) else {
            bail!("zalo oauth response carried no access token");
        };

        let expires_at = expires_in_secs(parsed.expires_in.as_ref())
            .map(|secs| now + chrono::Duration::seconds(secs));
        self.store
            .upsert_oauth_token(&OAuthTokenRecord {
                provider: "zalo".to_string(),
                // Zalo rotates the refresh token; keep the old one only if
                // the response omitted a replacement.
                access_token: Some(access_token),
                refresh_token: parsed.refresh_token.or(Some(refresh_token)),
                expires_at,
                updated_at: now,
            })
            .await?;
        Ok(true)
    }

    fn needs_refresh(&self, record: &OAuthTokenRecord, now: DateTime<Utc>) -> bool {
        match record.expires_at {
            Some(expires_at) => {
                expires_at - now <= chrono::Duration::seconds(self.refresh.expiry_margin_secs)
            }
            // An expiry we never learned is treated as already stale.
            None => true,
        }
    }
}

fn expires_in_secs(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
