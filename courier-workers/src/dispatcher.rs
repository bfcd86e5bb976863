use std::sync::Arc;

use courier_core::redis::RedisPool;
use courier_core::store::DynStore;
use courier_core::types::{Channel, ProviderResult, WorkerRequest};
use courier_core::{EngineError, EngineResult};
use courier_providers::Adapters;

use crate::inapp::InappWorker;
use crate::provider::ProviderWorker;

/// What one worker invocation produced: which ledger row was written, the
/// verdict recorded on it, and whether the attempt is worth retrying.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub delivery_id: String,
    pub result: ProviderResult,
    pub retryable: bool,
}

/// Routes a worker request to its channel worker. Dispatch is an explicit
/// match on the channel enum; a new channel fails to compile until every
/// routing site handles it.
pub struct Dispatcher {
    inapp: InappWorker,
    provider: ProviderWorker,
}

impl Dispatcher {
    pub fn new(store: DynStore, adapters: Arc<Adapters>, redis_pool: Option<RedisPool>) -> Self {
        Dispatcher {
            inapp: InappWorker::new(store.clone(), redis_pool),
            provider: ProviderWorker::new(store, adapters),
        }
    }

    pub async fn dispatch(
        &self,
        channel: Channel,
        req: &WorkerRequest,
    ) -> EngineResult<DispatchOutcome> {
        validate(channel, req)?;
        match channel {
            Channel::Inapp => self.inapp.handle(req).await,
            Channel::Push | Channel::Email | Channel::Sms | Channel::Zalo | Channel::Viber => {
                self.provider.handle(channel, req).await
            }
        }
    }
}

fn validate(channel: Channel, req: &WorkerRequest) -> EngineResult<()> {
    if req.job_id.is_empty() {
        return Err(EngineError::validation("jobId is required"));
    }
    if req.payload.title.is_empty() {
        return Err(EngineError::validation("payload.title is required"));
    }
    if req.payload.body.is_empty() {
        return Err(EngineError::validation("payload.body is required"));
    }
    if channel == Channel::Inapp && req.uid.as_deref().unwrap_or_default().is_empty() {
        return Err(EngineError::validation("uid is required for inapp"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::config::ProviderConfig;
    use courier_core::store::MemoryStore;
    use courier_core::types::{DeliveryStatus, MessagePayload, SendStatus};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base: &str) -> ProviderConfig {
        ProviderConfig {
            fcm_server_key: Some("fcm-test-key".to_string()),
            fcm_api_base: format!("{}/fcm", base),
            resend_api_key: Some("resend-test-key".to_string()),
            resend_from_email: Some("noreply@rentals.test".to_string()),
            resend_api_base: base.to_string(),
            sms_gateway_url: Some(format!("{}/sms", base)),
            sms_api_key: Some("sms-test-key".to_string()),
            sms_sender_id: Some("RENTALS".to_string()),
            zalo_app_id: Some("zalo-app".to_string()),
            zalo_secret_key: Some("zalo-secret".to_string()),
            zalo_api_base: format!("{}/zalo", base),
            zalo_oauth_base: format!("{}/zalo-oauth", base),
            viber_auth_token: Some("viber-test-token".to_string()),
            viber_sender_name: Some("Rentals".to_string()),
            viber_api_base: format!("{}/viber", base),
        }
    }

    fn dispatcher(base: &str) -> (Dispatcher, DynStore) {
        let store: DynStore = Arc::new(MemoryStore::new());
        let adapters = Arc::new(Adapters::new(&test_config(base), store.clone()).unwrap());
        (Dispatcher::new(store.clone(), adapters, None), store)
    }

    fn request(job_id: &str, uid: Option<&str>, target: Option<serde_json::Value>) -> WorkerRequest {
        WorkerRequest {
            job_id: job_id.to_string(),
            uid: uid.map(|u| u.to_string()),
            payload: MessagePayload {
                title: "Booking confirmed".to_string(),
                body: "Your camera is ready for pickup".to_string(),
                action_url: Some("/orders/42".to_string()),
            },
            target,
            topic: None,
        }
    }

    #[tokio::test]
    async fn missing_fields_fail_validation() {
        let (dispatcher, _) = dispatcher("http://unused.test");

        let req = request("", Some("u1"), None);
        let err = dispatcher.dispatch(Channel::Inapp, &req).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let mut req = request("job-1", Some("u1"), None);
        req.payload.body = String::new();
        let err = dispatcher.dispatch(Channel::Inapp, &req).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        // uid is only mandatory for the in-app channel.
        let req = request("job-1", None, None);
        let err = dispatcher.dispatch(Channel::Inapp, &req).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(dispatcher.dispatch(Channel::Email, &req).await.is_ok());
    }

    #[tokio::test]
    async fn inapp_delivers_immediately_and_collapses_repeats() {
        let (dispatcher, store) = dispatcher("http://unused.test");
        let req = request("job-1", Some("u1"), None);

        let outcome = dispatcher.dispatch(Channel::Inapp, &req).await.unwrap();
        assert_eq!(outcome.result.status, SendStatus::Sent);
        assert!(!outcome.retryable);

        let row = store.get_delivery(&outcome.delivery_id).await.unwrap().unwrap();
        assert_eq!(row.status, DeliveryStatus::Delivered);
        assert!(row.delivered_at.is_some());
        assert_eq!(
            row.meta.unwrap()["inbox_id"].as_str(),
            Some(outcome.delivery_id.as_str())
        );

        let inbox = store.list_inbox("u1", 10).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].id, outcome.delivery_id);
        assert_eq!(inbox[0].title, "Booking confirmed");

        // Same job, same user: one inbox record, one ledger row, two attempts.
        dispatcher.dispatch(Channel::Inapp, &req).await.unwrap();
        assert_eq!(store.list_inbox("u1", 10).await.unwrap().len(), 1);
        let row = store.get_delivery(&outcome.delivery_id).await.unwrap().unwrap();
        assert_eq!(row.attempts, 2);
    }

    #[tokio::test]
    async fn email_verdict_lands_in_the_ledger() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "re_123"})))
            .mount(&server)
            .await;

        let (dispatcher, store) = dispatcher(&server.uri());
        let req = request("job-1", Some("u1"), Some(json!({"to": "ann@example.com"})));
        let outcome = dispatcher.dispatch(Channel::Email, &req).await.unwrap();

        assert_eq!(outcome.result.status, SendStatus::Sent);
        assert!(!outcome.retryable);
        let row = store.get_delivery(&outcome.delivery_id).await.unwrap().unwrap();
        assert_eq!(row.status, DeliveryStatus::Sent);
        assert_eq!(row.provider.as_deref(), Some("resend"));
        assert_eq!(row.provider_message_id.as_deref(), Some("re_123"));
        assert!(row.sent_at.is_some());
        assert_eq!(row.attempts, 1);
    }

    #[tokio::test]
    async fn transport_failure_is_recorded_and_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (dispatcher, store) = dispatcher(&server.uri());
        let req = request("job-1", Some("u1"), Some(json!({"to": "ann@example.com"})));

        let outcome = dispatcher.dispatch(Channel::Email, &req).await.unwrap();
        assert!(outcome.retryable);
        assert_eq!(outcome.result.status, SendStatus::Failed);
        assert_eq!(outcome.result.error_code.as_deref(), Some("transport"));

        // The retry overwrites the same row and bumps its attempt count.
        dispatcher.dispatch(Channel::Email, &req).await.unwrap();
        let row = store.get_delivery(&outcome.delivery_id).await.unwrap().unwrap();
        assert_eq!(row.status, DeliveryStatus::Failed);
        assert_eq!(row.attempts, 2);
        assert!(row.sent_at.is_none());
    }

    #[tokio::test]
    async fn empty_target_is_a_terminal_skip() {
        let (dispatcher, store) = dispatcher("http://unused.test");
        let req = request("job-1", Some("u1"), None);

        let outcome = dispatcher.dispatch(Channel::Sms, &req).await.unwrap();
        assert_eq!(outcome.result.status, SendStatus::Skipped);
        assert_eq!(outcome.result.error_code.as_deref(), Some("no_target"));
        assert!(!outcome.retryable);

        let row = store.get_delivery(&outcome.delivery_id).await.unwrap().unwrap();
        assert_eq!(row.status, DeliveryStatus::Skipped);
    }
}
