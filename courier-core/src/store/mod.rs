use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::EngineResult;
use crate::types::{
    ChatIdentity, Channel, Delivery, InboxNotification, JobStatus, LinkCode, NotificationJob,
    OAuthTokenRecord, OutboxItem, OutboxPayload, Template, UserPreference,
};

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

pub type DynStore = Arc<dyn Store>;

/// Outcome of a link-code redemption attempt. Exactly one of these holds for
/// any (code, instant) pair; the store decides it atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkRedemption {
    Linked { uid: String },
    NotFound,
    AlreadyUsed,
    Expired,
}

/// Defaults used when redemption has to create a preference record for a
/// user the marketplace app has not provisioned yet.
#[derive(Debug, Clone)]
pub struct PreferenceSeed {
    pub language: String,
    pub timezone: String,
}

/// Persistence boundary for the whole engine. Everything above this trait is
/// storage-agnostic: production runs on Postgres, tests on the in-memory
/// implementation.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_job(&self, job: &NotificationJob) -> EngineResult<()>;
    async fn get_job(&self, id: &str) -> EngineResult<Option<NotificationJob>>;
    async fn set_job_status(
        &self,
        id: &str,
        status: JobStatus,
        reason: Option<&str>,
    ) -> EngineResult<()>;

    async fn get_template(&self, id: &str) -> EngineResult<Option<Template>>;
    async fn upsert_template(&self, template: &Template) -> EngineResult<()>;

    async fn get_preference(&self, uid: &str) -> EngineResult<Option<UserPreference>>;
    async fn upsert_preference(&self, pref: &UserPreference) -> EngineResult<()>;

    /// Insert a row only if none exists yet. Used for the `pending`
    /// placeholder written at dispatch time; it must never clobber a result
    /// a worker already recorded.
    async fn seed_delivery(&self, row: &Delivery) -> EngineResult<()>;
    /// Write one attempt's outcome. Keyed by the deterministic delivery id:
    /// a second invocation for the same (job, channel, recipient) overwrites
    /// the result fields and bumps `attempts` instead of inserting a row.
    async fn upsert_delivery(&self, row: &Delivery) -> EngineResult<()>;
    /// Overwrite an existing row in place (webhook status updates). Does not
    /// touch `attempts`.
    async fn update_delivery(&self, row: &Delivery) -> EngineResult<()>;
    async fn get_delivery(&self, id: &str) -> EngineResult<Option<Delivery>>;
    async fn find_delivery_by_provider_message(
        &self,
        provider: &str,
        provider_message_id: &str,
    ) -> EngineResult<Option<Delivery>>;
    async fn list_deliveries_for_job(&self, job_id: &str) -> EngineResult<Vec<Delivery>>;

    /// Returns false when a record with this id already exists, so callers
    /// can keep side effects (unread counters) from double-firing.
    async fn insert_inbox(&self, item: &InboxNotification) -> EngineResult<bool>;
    async fn list_inbox(&self, uid: &str, limit: i64) -> EngineResult<Vec<InboxNotification>>;
    async fn unread_inbox_count(&self, uid: &str) -> EngineResult<i64>;
    /// Returns true only when this call flipped the record from unread to
    /// read, mirroring [`Store::insert_inbox`] for the decrement side.
    async fn mark_inbox_read(&self, uid: &str, id: &str) -> EngineResult<bool>;

    async fn enqueue_outbox(
        &self,
        job_id: &str,
        uid: &str,
        channel: Channel,
        payload: &OutboxPayload,
        next_attempt_at: DateTime<Utc>,
    ) -> EngineResult<i64>;
    /// Unprocessed, non-dead items whose `next_attempt_at` has passed,
    /// oldest first.
    async fn due_outbox(&self, now: DateTime<Utc>, limit: i64) -> EngineResult<Vec<OutboxItem>>;
    async fn complete_outbox(&self, id: i64) -> EngineResult<()>;
    /// Failed attempt: bump `attempts`, record the error, schedule the next
    /// try.
    async fn retry_outbox(
        &self,
        id: i64,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> EngineResult<()>;
    /// Push an item forward without consuming an attempt (quiet hours).
    async fn defer_outbox(&self, id: i64, next_attempt_at: DateTime<Utc>) -> EngineResult<()>;
    async fn mark_outbox_dead(&self, id: i64, error: &str) -> EngineResult<()>;

    /// Returns false when the code already exists; the issuer re-rolls.
    async fn insert_link_code(&self, code: &LinkCode) -> EngineResult<bool>;
    async fn get_link_code(&self, code: &str) -> EngineResult<Option<LinkCode>>;
    /// Atomic redemption: checks expiry then the used flag, marks the code
    /// used, binds the chat identity to the code's uid and records the chat
    /// user id in the user's contact info, all in one transaction. Two
    /// concurrent redemptions of one code cannot both link.
    async fn redeem_link_code(
        &self,
        provider: &str,
        external_id: &str,
        code: &str,
        seed: &PreferenceSeed,
        now: DateTime<Utc>,
    ) -> EngineResult<LinkRedemption>;

    async fn upsert_chat_identity(&self, identity: &ChatIdentity) -> EngineResult<()>;
    async fn get_chat_identity(
        &self,
        provider: &str,
        external_id: &str,
    ) -> EngineResult<Option<ChatIdentity>>;

    async fn get_oauth_token(&self, provider: &str) -> EngineResult<Option<OAuthTokenRecord>>;
    async fn upsert_oauth_token(&self, token: &OAuthTokenRecord) -> EngineResult<()>;
}
