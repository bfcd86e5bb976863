use anyhow::Result;
use async_trait::async_trait;

use courier_core::config::ProviderConfig;
use courier_core::store::DynStore;
use courier_core::types::{Channel, MessagePayload, ProviderResult, SendContext, SendTarget};

pub mod email;
pub mod fcm;
pub mod sms;
pub mod viber;
pub mod zalo;

pub use email::EmailAdapter;
pub use fcm::FcmAdapter;
pub use sms::SmsAdapter;
pub use viber::ViberAdapter;
pub use zalo::ZaloAdapter;

/// One external delivery provider. `Ok` carries the provider's verdict, sent
/// or failed or skipped, and is terminal for the attempt. `Err` means we
/// never got a verdict (network, timeout, provider 5xx) and the attempt may
/// be retried.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(
        &self,
        target: &SendTarget,
        payload: &MessagePayload,
        ctx: &SendContext,
    ) -> Result<ProviderResult>;
}

/// Every configured adapter, one per provider channel. Adapters without
/// credentials still exist and report `skipped`, so a half-configured
/// deployment degrades instead of erroring.
pub struct Adapters {
    pub push: FcmAdapter,
    pub email: EmailAdapter,
    pub sms: SmsAdapter,
    pub zalo: ZaloAdapter,
    pub viber: ViberAdapter,
}

impl Adapters {
    pub fn new(config: &ProviderConfig, store: DynStore) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Adapters {
            push: FcmAdapter::new(config, client.clone()),
            email: EmailAdapter::new(config, client.clone()),
            sms: SmsAdapter::new(config, client.clone()),
            zalo: ZaloAdapter::new(config, client.clone(), store),
            viber: ViberAdapter::new(config, client),
        })
    }

    /// The adapter behind a channel. `None` for the in-app channel, which is
    /// served from our own store rather than a provider.
    pub fn for_channel(&self, channel: Channel) -> Option<&dyn ProviderAdapter> {
        match channel {
            Channel::Inapp => None,
            Channel::Push => Some(&self.push),
            Channel::Email => Some(&self.email),
            Channel::Sms => Some(&self.sms),
            Channel::Zalo => Some(&self.zalo),
            Channel::Viber => Some(&self.viber),
        }
    }
}

/// Read an HTTP response, mapping provider 5xx to a retryable error and
/// anything else through to the caller.
pub(crate) async fn read_body(
    provider: &str,
    response: reqwest::Response,
) -> Result<(reqwest::StatusCode, String)> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        anyhow::bail!("{} returned {}: {}", provider, status, body);
    }
    Ok((status, body))
}
