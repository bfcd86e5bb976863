use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::error::EngineResult;
use crate::store::{LinkRedemption, PreferenceSeed, Store};
use crate::types::{
    ChatIdentity, Channel, ContactInfo, Delivery, InboxNotification, JobStatus, LinkCode,
    NotificationJob, OAuthTokenRecord, OutboxItem, OutboxPayload, Template, UserPreference,
};

#[derive(Default)]
struct State {
    jobs: HashMap<String, NotificationJob>,
    templates: HashMap<String, Template>,
    preferences: HashMap<String, UserPreference>,
    deliveries: HashMap<String, Delivery>,
    inbox: HashMap<String, InboxNotification>,
    outbox: BTreeMap<i64, OutboxItem>,
    outbox_seq: i64,
    link_codes: HashMap<String, LinkCode>,
    identities: HashMap<(String, String), ChatIdentity>,
    tokens: HashMap<String, OAuthTokenRecord>,
}

/// In-memory store. One lock over the whole state keeps multi-table
/// operations (link redemption) atomic, the same guarantee the Postgres
/// implementation gets from a transaction.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_job(&self, job: &NotificationJob) -> EngineResult<()> {
        self.state.write().await.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> EngineResult<Option<NotificationJob>> {
        Ok(self.state.read().await.jobs.get(id).cloned())
    }

    async fn set_job_status(
        &self,
        id: &str,
        status: JobStatus,
        reason: Option<&str>,
    ) -> EngineResult<()> {
        if let Some(job) = self.state.write().await.jobs.get_mut(id) {
            job.status = status;
            job.status_reason = reason.map(|r| r.to_string());
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_template(&self, id: &str) -> EngineResult<Option<Template>> {
        Ok(self.state.read().await.templates.get(id).cloned())
    }

    async fn upsert_template(&self, template: &Template) -> EngineResult<()> {
        self.state
            .write()
            .await
            .templates
            .insert(template.id.clone(), template.clone());
        Ok(())
    }

    async fn get_preference(&self, uid: &str) -> EngineResult<Option<UserPreference>> {
        Ok(self.state.read().await.preferences.get(uid).cloned())
    }

    async fn upsert_preference(&self, pref: &UserPreference) -> EngineResult<()> {
        self.state
            .write()
            .await
            .preferences
            .insert(pref.uid.clone(), pref.clone());
        Ok(())
    }

    async fn seed_delivery(&self, row: &Delivery) -> EngineResult<()> {
        let mut state = self.state.write().await;
        state
            .deliveries
            .entry(row.id.clone())
            .or_insert_with(|| row.clone());
        Ok(())
    }

    async fn upsert_delivery(&self, row: &Delivery) -> EngineResult<()> {
        let mut state = self.state.write().await;
        match state.deliveries.get_mut(&row.id) {
            Some(existing) => {
                let attempts = existing.attempts + 1;
                let events = std::mem::take(&mut existing.events);
                let created_at = existing.created_at;
                let mut next = row.clone();
                next.attempts = attempts;
                next.events = events;
                next.created_at = created_at;
                *existing = next;
            }
            None => {
                state.deliveries.insert(row.id.clone(), row.clone());
            }
        }
        Ok(())
    }

    async fn update_delivery(&self, row: &Delivery) -> EngineResult<()> {
        self.state
            .write()
            .await
            .deliveries
            .insert(row.id.clone(), row.clone());
        Ok(())
    }

    async fn get_delivery(&self, id: &str) -> EngineResult<Option<Delivery>> {
        Ok(self.state.read().await.deliveries.get(id).cloned())
    }

    async fn find_delivery_by_provider_message(
        &self,
        provider: &str,
        provider_message_id: &str,
    ) -> EngineResult<Option<Delivery>> {
        Ok(self
            .state
            .read()
            .await
            .deliveries
            .values()
            .find(|d| {
                d.provider.as_deref() == Some(provider)
                    && d.provider_message_id.as_deref() == Some(provider_message_id)
            })
            .cloned())
    }

    async fn list_deliveries_for_job(&self, job_id: &str) -> EngineResult<Vec<Delivery>> {
        let mut rows: Vec<Delivery> = self
            .state
            .read()
            .await
            .deliveries
            .values()
            .filter(|d| d.job_id == job_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn insert_inbox(&self, item: &InboxNotification) -> EngineResult<bool> {
        let mut state = self.state.write().await;
        if state.inbox.contains_key(&item.id) {
            return Ok(false);
        }
        state.inbox.insert(item.id.clone(), item.clone());
        Ok(true)
    }

    async fn list_inbox(&self, uid: &str, limit: i64) -> EngineResult<Vec<InboxNotification>> {
        let mut rows: Vec<InboxNotification> = self
            .state
            .read()
            .await
            .inbox
            .values()
            .filter(|n| n.uid == uid)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn unread_inbox_count(&self, uid: &str) -> EngineResult<i64> {
        Ok(self
            .state
            .read()
            .await
            .inbox
            .values()
            .filter(|n| n.uid == uid && !n.read)
            .count() as i64)
    }

    async fn mark_inbox_read(&self, uid: &str, id: &str) -> EngineResult<bool> {
        let mut state = self.state.write().await;
        match state.inbox.get_mut(id) {
            Some(item) if item.uid == uid && !item.read => {
                item.read = true;
                item.read_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn enqueue_outbox(
        &self,
        job_id: &str,
        uid: &str,
        channel: Channel,
        payload: &OutboxPayload,
        next_attempt_at: DateTime<Utc>,
    ) -> EngineResult<i64> {
        let mut state = self.state.write().await;
        state.outbox_seq += 1;
        let id = state.outbox_seq;
        state.outbox.insert(
            id,
            OutboxItem {
                id,
                job_id: job_id.to_string(),
                uid: uid.to_string(),
                channel,
                payload: payload.clone(),
                attempts: 0,
                next_attempt_at,
                last_error: None,
                created_at: Utc::now(),
                processed_at: None,
                dead: false,
            },
        );
        Ok(id)
    }

    async fn due_outbox(&self, now: DateTime<Utc>, limit: i64) -> EngineResult<Vec<OutboxItem>> {
        let state = self.state.read().await;
        let mut due: Vec<OutboxItem> = state
            .outbox
            .values()
            .filter(|item| !item.dead && item.processed_at.is_none() && item.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_attempt_at.cmp(&b.next_attempt_at).then(a.id.cmp(&b.id)));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn complete_outbox(&self, id: i64) -> EngineResult<()> {
        if let Some(item) = self.state.write().await.outbox.get_mut(&id) {
            item.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn retry_outbox(
        &self,
        id: i64,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> EngineResult<()> {
        if let Some(item) = self.state.write().await.outbox.get_mut(&id) {
            item.attempts += 1;
            item.next_attempt_at = next_attempt_at;
            item.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn defer_outbox(&self, id: i64, next_attempt_at: DateTime<Utc>) -> EngineResult<()> {
        if let Some(item) = self.state.write().await.outbox.get_mut(&id) {
            item.next_attempt_at = next_attempt_at;
        }
        Ok(())
    }

    async fn mark_outbox_dead(&self, id: i64, error: &str) -> EngineResult<()> {
        if let Some(item) = self.state.write().await.outbox.get_mut(&id) {
            item.dead = true;
            item.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn insert_link_code(&self, code: &LinkCode) -> EngineResult<bool> {
        let mut state = self.state.write().await;
        if state.link_codes.contains_key(&code.code) {
            return Ok(false);
        }
        state.link_codes.insert(code.code.clone(), code.clone());
        Ok(true)
    }

    async fn get_link_code(&self, code: &str) -> EngineResult<Option<LinkCode>> {
        Ok(self.state.read().await.link_codes.get(code).cloned())
    }

    async fn redeem_link_code(
        &self,
        provider: &str,
        external_id: &str,
        code: &str,
        seed: &PreferenceSeed,
        now: DateTime<Utc>,
    ) -> EngineResult<LinkRedemption> {
        let mut state = self.state.write().await;

        let uid = {
            let Some(record) = state.link_codes.get_mut(code) else {
                return Ok(LinkRedemption::NotFound);
            };
            // Expiry wins over the used flag.
            if record.expires_at <= now {
                return Ok(LinkRedemption::Expired);
            }
            if record.used {
                return Ok(LinkRedemption::AlreadyUsed);
            }
            record.used = true;
            record.used_at = Some(now);
            record.used_by_external_id = Some(external_id.to_string());
            record.uid.clone()
        };

        let key = (provider.to_string(), external_id.to_string());
        let identity = state.identities.entry(key).or_insert_with(|| ChatIdentity {
            provider: provider.to_string(),
            external_id: external_id.to_string(),
            uid: None,
            followed: false,
            last_seen_at: now,
            updated_at: now,
        });
        identity.uid = Some(uid.clone());
        identity.followed = true;
        identity.last_seen_at = now;
        identity.updated_at = now;

        let pref = state
            .preferences
            .entry(uid.clone())
            .or_insert_with(|| UserPreference {
                uid: uid.clone(),
                language: seed.language.clone(),
                timezone: seed.timezone.clone(),
                quiet_hours: None,
                contact: ContactInfo::default(),
            });
        pref.contact.set_chat_user_id(provider, external_id);

        Ok(LinkRedemption::Linked { uid })
    }

    async fn upsert_chat_identity(&self, identity: &ChatIdentity) -> EngineResult<()> {
        self.state.write().await.identities.insert(
            (identity.provider.clone(), identity.external_id.clone()),
            identity.clone(),
        );
        Ok(())
    }

    async fn get_chat_identity(
        &self,
        provider: &str,
        external_id: &str,
    ) -> EngineResult<Option<ChatIdentity>> {
        Ok(self
            .state
            .read()
            .await
            .identities
            .get(&(provider.to_string(), external_id.to_string()))
            .cloned())
    }

    async fn get_oauth_token(&self, provider: &str) -> EngineResult<Option<OAuthTokenRecord>> {
        Ok(self.state.read().await.tokens.get(provider).cloned())
    }

    async fn upsert_oauth_token(&self, token: &OAuthTokenRecord) -> EngineResult<()> {
        self.state
            .write()
            .await
            .tokens
            .insert(token.provider.clone(), token.clone());
        Ok(())
    }
}
