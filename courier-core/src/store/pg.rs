use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde_json::Value;
use std::sync::Arc;

use crate::db::{DbConnection, DbPool};
use crate::error::EngineResult;
use crate::schema::{
    channel_outbox, chat_identities, deliveries, inbox_notifications, link_codes,
    notification_jobs, notification_templates, oauth_tokens, user_preferences,
};
use crate::store::{LinkRedemption, PreferenceSeed, Store};
use crate::types::{
    ChatIdentity, Channel, ContactInfo, Delivery, DeliveryStatus, InboxNotification, JobStatus,
    LinkCode, NotificationJob, OAuthTokenRecord, OutboxItem, OutboxPayload, QuietHours, Template,
    UserPreference,
};

pub struct PgStore {
    pool: Arc<DbPool>,
}

impl PgStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> EngineResult<DbConnection> {
        self.pool
            .get()
            .await
            .map_err(|e| anyhow!("Failed to get database connection: {}", e).into())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> EngineResult<Value> {
    serde_json::to_value(value).map_err(|e| anyhow!("Failed to serialize column: {}", e).into())
}

fn from_json<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> EngineResult<T> {
    serde_json::from_value(value).map_err(|e| anyhow!("Malformed {} column: {}", what, e).into())
}

fn parse_channel(s: &str) -> EngineResult<Channel> {
    Channel::parse(s).ok_or_else(|| anyhow!("Unknown channel in row: {}", s).into())
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = crate::schema::notification_jobs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct JobRow {
    id: String,
    template_id: String,
    audience: Value,
    data: Value,
    required_channels: Option<Value>,
    topic: Option<String>,
    status: String,
    status_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn into_domain(self) -> EngineResult<NotificationJob> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("Unknown job status in row: {}", self.status))?;
        Ok(NotificationJob {
            id: self.id,
            template_id: self.template_id,
            audience: from_json(self.audience, "audience")?,
            data: self.data,
            required_channels: self
                .required_channels
                .map(|v| from_json(v, "required_channels"))
                .transpose()?,
            topic: self.topic,
            status,
            status_reason: self.status_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = crate::schema::notification_templates)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct TemplateRow {
    id: String,
    title: Value,
    body: Value,
    channels: Value,
}

impl TemplateRow {
    fn into_domain(self) -> EngineResult<Template> {
        Ok(Template {
            id: self.id,
            title: from_json(self.title, "title")?,
            body: from_json(self.body, "body")?,
            channels: from_json(self.channels, "channels")?,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = crate::schema::user_preferences)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct PreferenceRow {
    uid: String,
    language: String,
    timezone: String,
    quiet_start: Option<String>,
    quiet_end: Option<String>,
    contact: Value,
}

impl PreferenceRow {
    fn into_domain(self) -> EngineResult<UserPreference> {
        let quiet_hours = if self.quiet_start.is_none() && self.quiet_end.is_none() {
            None
        } else {
            Some(QuietHours {
                start: self.quiet_start,
                end: self.quiet_end,
            })
        };
        Ok(UserPreference {
            uid: self.uid,
            language: self.language,
            timezone: self.timezone,
            quiet_hours,
            contact: from_json(self.contact, "contact")?,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = crate::schema::deliveries)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct DeliveryRow {
    id: String,
    job_id: String,
    uid: Option<String>,
    channel: String,
    status: String,
    provider: Option<String>,
    provider_message_id: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    attempts: i32,
    meta: Option<Value>,
    events: Value,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    read_at: Option<DateTime<Utc>>,
}

impl DeliveryRow {
    fn into_domain(self) -> EngineResult<Delivery> {
        let status = DeliveryStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("Unknown delivery status in row: {}", self.status))?;
        Ok(Delivery {
            id: self.id,
            job_id: self.job_id,
            uid: self.uid,
            channel: parse_channel(&self.channel)?,
            status,
            provider: self.provider,
            provider_message_id: self.provider_message_id,
            error_code: self.error_code,
            error_message: self.error_message,
            attempts: self.attempts,
            meta: self.meta,
            events: from_json(self.events, "events")?,
            created_at: self.created_at,
            sent_at: self.sent_at,
            delivered_at: self.delivered_at,
            read_at: self.read_at,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = crate::schema::inbox_notifications)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct InboxRow {
    id: String,
    uid: String,
    job_id: String,
    title: String,
    body: String,
    action_url: Option<String>,
    topic: Option<String>,
    read: bool,
    read_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl InboxRow {
    fn into_domain(self) -> InboxNotification {
        InboxNotification {
            id: self.id,
            uid: self.uid,
            job_id: self.job_id,
            title: self.title,
            body: self.body,
            action_url: self.action_url,
            topic: self.topic,
            read: self.read,
            read_at: self.read_at,
            created_at: self.created_at,
        }
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = crate::schema::channel_outbox)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct OutboxRow {
    id: i64,
    job_id: String,
    uid: String,
    channel: String,
    payload: Value,
    attempts: i32,
    next_attempt_at: DateTime<Utc>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    dead: bool,
}

impl OutboxRow {
    fn into_domain(self) -> EngineResult<OutboxItem> {
        Ok(OutboxItem {
            id: self.id,
            job_id: self.job_id,
            uid: self.uid,
            channel: parse_channel(&self.channel)?,
            payload: from_json(self.payload, "payload")?,
            attempts: self.attempts,
            next_attempt_at: self.next_attempt_at,
            last_error: self.last_error,
            created_at: self.created_at,
            processed_at: self.processed_at,
            dead: self.dead,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = crate::schema::link_codes)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct LinkCodeRow {
    code: String,
    uid: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    used: bool,
    used_at: Option<DateTime<Utc>>,
    used_by_external_id: Option<String>,
}

impl LinkCodeRow {
    fn into_domain(self) -> LinkCode {
        LinkCode {
            code: self.code,
            uid: self.uid,
            created_at: self.created_at,
            expires_at: self.expires_at,
            used: self.used,
            used_at: self.used_at,
            used_by_external_id: self.used_by_external_id,
        }
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = crate::schema::chat_identities)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ChatIdentityRow {
    provider: String,
    external_id: String,
    uid: Option<String>,
    followed: bool,
    last_seen_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ChatIdentityRow {
    fn into_domain(self) -> ChatIdentity {
        ChatIdentity {
            provider: self.provider,
            external_id: self.external_id,
            uid: self.uid,
            followed: self.followed,
            last_seen_at: self.last_seen_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = crate::schema::oauth_tokens)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct OAuthTokenRow {
    provider: String,
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl OAuthTokenRow {
    fn into_domain(self) -> OAuthTokenRecord {
        OAuthTokenRecord {
            provider: self.provider,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self.expires_at,
            updated_at: self.updated_at,
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_job(&self, job: &NotificationJob) -> EngineResult<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(notification_jobs::table)
            .values((
                notification_jobs::id.eq(&job.id),
                notification_jobs::template_id.eq(&job.template_id),
                notification_jobs::audience.eq(to_json(&job.audience)?),
                notification_jobs::data.eq(&job.data),
                notification_jobs::required_channels
                    .eq(job.required_channels.as_ref().map(to_json).transpose()?),
                notification_jobs::topic.eq(job.topic.as_deref()),
                notification_jobs::status.eq(job.status.as_str()),
                notification_jobs::status_reason.eq(job.status_reason.as_deref()),
                notification_jobs::created_at.eq(job.created_at),
                notification_jobs::updated_at.eq(job.updated_at),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> EngineResult<Option<NotificationJob>> {
        let mut conn = self.conn().await?;
        let row = notification_jobs::table
            .find(id)
            .select(JobRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(JobRow::into_domain).transpose()
    }

    async fn set_job_status(
        &self,
        id: &str,
        status: JobStatus,
        reason: Option<&str>,
    ) -> EngineResult<()> {
        let mut conn = self.conn().await?;
        diesel::update(notification_jobs::table.find(id))
            .set((
                notification_jobs::status.eq(status.as_str()),
                notification_jobs::status_reason.eq(reason),
                notification_jobs::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_template(&self, id: &str) -> EngineResult<Option<Template>> {
        let mut conn = self.conn().await?;
        let row = notification_templates::table
            .find(id)
            .select(TemplateRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(TemplateRow::into_domain).transpose()
    }

    async fn upsert_template(&self, template: &Template) -> EngineResult<()> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let title = to_json(&template.title)?;
        let body = to_json(&template.body)?;
        let channels = to_json(&template.channels)?;
        diesel::insert_into(notification_templates::table)
            .values((
                notification_templates::id.eq(&template.id),
                notification_templates::title.eq(&title),
                notification_templates::body.eq(&body),
                notification_templates::channels.eq(&channels),
                notification_templates::created_at.eq(now),
                notification_templates::updated_at.eq(now),
            ))
            .on_conflict(notification_templates::id)
            .do_update()
            .set((
                notification_templates::title.eq(&title),
                notification_templates::body.eq(&body),
                notification_templates::channels.eq(&channels),
                notification_templates::updated_at.eq(now),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_preference(&self, uid: &str) -> EngineResult<Option<UserPreference>> {
        let mut conn = self.conn().await?;
        let row = user_preferences::table
            .find(uid)
            .select(PreferenceRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(PreferenceRow::into_domain).transpose()
    }

    async fn upsert_preference(&self, pref: &UserPreference) -> EngineResult<()> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let contact = to_json(&pref.contact)?;
        let quiet_start = pref.quiet_hours.as_ref().and_then(|q| q.start.clone());
        let quiet_end = pref.quiet_hours.as_ref().and_then(|q| q.end.clone());
        diesel::insert_into(user_preferences::table)
            .values((
                user_preferences::uid.eq(&pref.uid),
                user_preferences::language.eq(&pref.language),
                user_preferences::timezone.eq(&pref.timezone),
                user_preferences::quiet_start.eq(&quiet_start),
                user_preferences::quiet_end.eq(&quiet_end),
                user_preferences::contact.eq(&contact),
                user_preferences::created_at.eq(now),
                user_preferences::updated_at.eq(now),
            ))
            .on_conflict(user_preferences::uid)
            .do_update()
            .set((
                user_preferences::language.eq(&pref.language),
                user_preferences::timezone.eq(&pref.timezone),
                user_preferences::quiet_start.eq(&quiet_start),
                user_preferences::quiet_end.eq(&quiet_end),
                user_preferences::contact.eq(&contact),
                user_preferences::updated_at.eq(now),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn seed_delivery(&self, row: &Delivery) -> EngineResult<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(deliveries::table)
            .values((
                deliveries::id.eq(&row.id),
                deliveries::job_id.eq(&row.job_id),
                deliveries::uid.eq(row.uid.as_deref()),
                deliveries::channel.eq(row.channel.as_str()),
                deliveries::status.eq(row.status.as_str()),
                deliveries::provider.eq(row.provider.as_deref()),
                deliveries::provider_message_id.eq(row.provider_message_id.as_deref()),
                deliveries::error_code.eq(row.error_code.as_deref()),
                deliveries::error_message.eq(row.error_message.as_deref()),
                deliveries::attempts.eq(row.attempts),
                deliveries::meta.eq(row.meta.as_ref()),
                deliveries::events.eq(to_json(&row.events)?),
                deliveries::created_at.eq(row.created_at),
                deliveries::sent_at.eq(row.sent_at),
                deliveries::delivered_at.eq(row.delivered_at),
                deliveries::read_at.eq(row.read_at),
            ))
            .on_conflict(deliveries::id)
            .do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn upsert_delivery(&self, row: &Delivery) -> EngineResult<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(deliveries::table)
            .values((
                deliveries::id.eq(&row.id),
                deliveries::job_id.eq(&row.job_id),
                deliveries::uid.eq(row.uid.as_deref()),
                deliveries::channel.eq(row.channel.as_str()),
                deliveries::status.eq(row.status.as_str()),
                deliveries::provider.eq(row.provider.as_deref()),
                deliveries::provider_message_id.eq(row.provider_message_id.as_deref()),
                deliveries::error_code.eq(row.error_code.as_deref()),
                deliveries::error_message.eq(row.error_message.as_deref()),
                deliveries::attempts.eq(row.attempts),
                deliveries::meta.eq(row.meta.as_ref()),
                deliveries::events.eq(to_json(&row.events)?),
                deliveries::created_at.eq(row.created_at),
                deliveries::sent_at.eq(row.sent_at),
                deliveries::delivered_at.eq(row.delivered_at),
                deliveries::read_at.eq(row.read_at),
            ))
            .on_conflict(deliveries::id)
            .do_update()
            .set((
                deliveries::uid.eq(row.uid.as_deref()),
                deliveries::status.eq(row.status.as_str()),
                deliveries::provider.eq(row.provider.as_deref()),
                deliveries::provider_message_id.eq(row.provider_message_id.as_deref()),
                deliveries::error_code.eq(row.error_code.as_deref()),
                deliveries::error_message.eq(row.error_message.as_deref()),
                deliveries::meta.eq(row.meta.as_ref()),
                // Attempts count monotonically; events stay as written.
                deliveries::attempts.eq(deliveries::attempts + 1),
                deliveries::sent_at.eq(row.sent_at),
                deliveries::delivered_at.eq(row.delivered_at),
                deliveries::read_at.eq(row.read_at),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn update_delivery(&self, row: &Delivery) -> EngineResult<()> {
        let mut conn = self.conn().await?;
        diesel::update(deliveries::table.find(&row.id))
            .set((
                deliveries::status.eq(row.status.as_str()),
                deliveries::provider.eq(row.provider.as_deref()),
                deliveries::provider_message_id.eq(row.provider_message_id.as_deref()),
                deliveries::error_code.eq(row.error_code.as_deref()),
                deliveries::error_message.eq(row.error_message.as_deref()),
                deliveries::meta.eq(row.meta.as_ref()),
                deliveries::events.eq(to_json(&row.events)?),
                deliveries::sent_at.eq(row.sent_at),
                deliveries::delivered_at.eq(row.delivered_at),
                deliveries::read_at.eq(row.read_at),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_delivery(&self, id: &str) -> EngineResult<Option<Delivery>> {
        let mut conn = self.conn().await?;
        let row = deliveries::table
            .find(id)
            .select(DeliveryRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(DeliveryRow::into_domain).transpose()
    }

    async fn find_delivery_by_provider_message(
        &self,
        provider: &str,
        provider_message_id: &str,
    ) -> EngineResult<Option<Delivery>> {
        let mut conn = self.conn().await?;
        let row = deliveries::table
            .filter(deliveries::provider.eq(provider))
            .filter(deliveries::provider_message_id.eq(provider_message_id))
            .select(DeliveryRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(DeliveryRow::into_domain).transpose()
    }

    async fn list_deliveries_for_job(&self, job_id: &str) -> EngineResult<Vec<Delivery>> {
        let mut conn = self.conn().await?;
        let rows: Vec<DeliveryRow> = deliveries::table
            .filter(deliveries::job_id.eq(job_id))
            .order((deliveries::created_at.asc(), deliveries::id.asc()))
            .select(DeliveryRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(DeliveryRow::into_domain).collect()
    }

    async fn insert_inbox(&self, item: &InboxNotification) -> EngineResult<bool> {
        let mut conn = self.conn().await?;
        let inserted = diesel::insert_into(inbox_notifications::table)
            .values((
                inbox_notifications::id.eq(&item.id),
                inbox_notifications::uid.eq(&item.uid),
                inbox_notifications::job_id.eq(&item.job_id),
                inbox_notifications::title.eq(&item.title),
                inbox_notifications::body.eq(&item.body),
                inbox_notifications::action_url.eq(item.action_url.as_deref()),
                inbox_notifications::topic.eq(item.topic.as_deref()),
                inbox_notifications::read.eq(item.read),
                inbox_notifications::read_at.eq(item.read_at),
                inbox_notifications::created_at.eq(item.created_at),
            ))
            .on_conflict(inbox_notifications::id)
            .do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(inserted > 0)
    }

    async fn list_inbox(&self, uid: &str, limit: i64) -> EngineResult<Vec<InboxNotification>> {
        let mut conn = self.conn().await?;
        let rows: Vec<InboxRow> = inbox_notifications::table
            .filter(inbox_notifications::uid.eq(uid))
            .order(inbox_notifications::created_at.desc())
            .limit(limit)
            .select(InboxRow::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows.into_iter().map(InboxRow::into_domain).collect())
    }

    async fn unread_inbox_count(&self, uid: &str) -> EngineResult<i64> {
        let mut conn = self.conn().await?;
        let count = inbox_notifications::table
            .filter(inbox_notifications::uid.eq(uid))
            .filter(inbox_notifications::read.eq(false))
            .count()
            .get_result(&mut conn)
            .await?;
        Ok(count)
    }

    async fn mark_inbox_read(&self, uid: &str, id: &str) -> EngineResult<bool> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            inbox_notifications::table
                .filter(inbox_notifications::id.eq(id))
                .filter(inbox_notifications::uid.eq(uid))
                .filter(inbox_notifications::read.eq(false)),
        )
        .set((
            inbox_notifications::read.eq(true),
            inbox_notifications::read_at.eq(Some(Utc::now())),
        ))
        .execute(&mut conn)
        .await?;
        Ok(updated > 0)
    }

    async fn enqueue_outbox(
        &self,
        job_id: &str,
        uid: &str,
        channel: Channel,
        payload: &OutboxPayload,
        next_attempt_at: DateTime<Utc>,
    ) -> EngineResult<i64> {
        let mut conn = self.conn().await?;
        let id = diesel::insert_into(channel_outbox::table)
            .values((
                channel_outbox::job_id.eq(job_id),
                channel_outbox::uid.eq(uid),
                channel_outbox::channel.eq(channel.as_str()),
                channel_outbox::payload.eq(to_json(payload)?),
                channel_outbox::attempts.eq(0),
                channel_outbox::next_attempt_at.eq(next_attempt_at),
                channel_outbox::created_at.eq(Utc::now()),
                channel_outbox::dead.eq(false),
            ))
            .returning(channel_outbox::id)
            .get_result(&mut conn)
            .await?;
        Ok(id)
    }

    async fn due_outbox(&self, now: DateTime<Utc>, limit: i64) -> EngineResult<Vec<OutboxItem>> {
        let mut conn = self.conn().await?;
        let rows: Vec<OutboxRow> = channel_outbox::table
            .filter(channel_outbox::processed_at.is_null())
            .filter(channel_outbox::dead.eq(false))
            .filter(channel_outbox::next_attempt_at.le(now))
            .order((channel_outbox::next_attempt_at.asc(), channel_outbox::id.asc()))
            .limit(limit)
            .select(OutboxRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(OutboxRow::into_domain).collect()
    }

    async fn complete_outbox(&self, id: i64) -> EngineResult<()> {
        let mut conn = self.conn().await?;
        diesel::update(channel_outbox::table.find(id))
            .set(channel_outbox::processed_at.eq(Some(Utc::now())))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn retry_outbox(
        &self,
        id: i64,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> EngineResult<()> {
        let mut conn = self.conn().await?;
        diesel::update(channel_outbox::table.find(id))
            .set((
                channel_outbox::attempts.eq(channel_outbox::attempts + 1),
                channel_outbox::next_attempt_at.eq(next_attempt_at),
                channel_outbox::last_error.eq(Some(error)),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn defer_outbox(&self, id: i64, next_attempt_at: DateTime<Utc>) -> EngineResult<()> {
        let mut conn = self.conn().await?;
        diesel::update(channel_outbox::table.find(id))
            .set(channel_outbox::next_attempt_at.eq(next_attempt_at))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn mark_outbox_dead(&self, id: i64, error: &str) -> EngineResult<()> {
        let mut conn = self.conn().await?;
        diesel::update(channel_outbox::table.find(id))
            .set((
                channel_outbox::dead.eq(true),
                channel_outbox::last_error.eq(Some(error)),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn insert_link_code(&self, code: &LinkCode) -> EngineResult<bool> {
        let mut conn = self.conn().await?;
        let inserted = diesel::insert_into(link_codes::table)
            .values((
                link_codes::code.eq(&code.code),
                link_codes::uid.eq(&code.uid),
                link_codes::created_at.eq(code.created_at),
                link_codes::expires_at.eq(code.expires_at),
                link_codes::used.eq(code.used),
                link_codes::used_at.eq(code.used_at),
                link_codes::used_by_external_id.eq(code.used_by_external_id.as_deref()),
            ))
            .on_conflict(link_codes::code)
            .do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(inserted > 0)
    }

    async fn get_link_code(&self, code: &str) -> EngineResult<Option<LinkCode>> {
        let mut conn = self.conn().await?;
        let row = link_codes::table
            .find(code)
            .select(LinkCodeRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(row.map(LinkCodeRow::into_domain))
    }

    async fn redeem_link_code(
        &self,
        provider: &str,
        external_id: &str,
        code: &str,
        seed: &PreferenceSeed,
        now: DateTime<Utc>,
    ) -> EngineResult<LinkRedemption> {
        let mut conn = self.conn().await?;
        let outcome = conn
            .transaction::<LinkRedemption, crate::error::EngineError, _>(|conn| {
                async move {
                    let record = link_codes::table
                        .find(code)
                        .for_update()
                        .select(LinkCodeRow::as_select())
                        .first(conn)
                        .await
                        .optional()?;

                    let Some(record) = record else {
                        return Ok(LinkRedemption::NotFound);
                    };
                    // Expiry wins over the used flag.
                    if record.expires_at <= now {
                        return Ok(LinkRedemption::Expired);
                    }
                    if record.used {
                        return Ok(LinkRedemption::AlreadyUsed);
                    }

                    diesel::update(link_codes::table.find(code))
                        .set((
                            link_codes::used.eq(true),
                            link_codes::used_at.eq(Some(now)),
                            link_codes::used_by_external_id.eq(Some(external_id)),
                        ))
                        .execute(conn)
                        .await?;

                    diesel::insert_into(chat_identities::table)
                        .values((
                            chat_identities::provider.eq(provider),
                            chat_identities::external_id.eq(external_id),
                            chat_identities::uid.eq(Some(record.uid.as_str())),
                            chat_identities::followed.eq(true),
                            chat_identities::last_seen_at.eq(now),
                            chat_identities::updated_at.eq(now),
                        ))
                        .on_conflict((chat_identities::provider, chat_identities::external_id))
                        .do_update()
                        .set((
                            chat_identities::uid.eq(Some(record.uid.as_str())),
                            chat_identities::followed.eq(true),
                            chat_identities::last_seen_at.eq(now),
                            chat_identities::updated_at.eq(now),
                        ))
                        .execute(conn)
                        .await?;

                    let pref = user_preferences::table
                        .find(&record.uid)
                        .select(PreferenceRow::as_select())
                        .first(conn)
                        .await
                        .optional()?;
                    match pref {
                        Some(row) => {
                            let mut contact: ContactInfo = from_json(row.contact, "contact")?;
                            contact.set_chat_user_id(provider, external_id);
                            diesel::update(user_preferences::table.find(&record.uid))
                                .set((
                                    user_preferences::contact.eq(to_json(&contact)?),
                                    user_preferences::updated_at.eq(now),
                                ))
                                .execute(conn)
                                .await?;
                        }
                        None => {
                            let mut contact = ContactInfo::default();
                            contact.set_chat_user_id(provider, external_id);
                            diesel::insert_into(user_preferences::table)
                                .values((
                                    user_preferences::uid.eq(&record.uid),
                                    user_preferences::language.eq(&seed.language),
                                    user_preferences::timezone.eq(&seed.timezone),
                                    user_preferences::quiet_start.eq(None::<String>),
                                    user_preferences::quiet_end.eq(None::<String>),
                                    user_preferences::contact.eq(to_json(&contact)?),
                                    user_preferences::created_at.eq(now),
                                    user_preferences::updated_at.eq(now),
                                ))
                                .execute(conn)
                                .await?;
                        }
                    }

                    Ok(LinkRedemption::Linked { uid: record.uid })
                }
                .scope_boxed()
            })
            .await?;
        Ok(outcome)
    }

    async fn upsert_chat_identity(&self, identity: &ChatIdentity) -> EngineResult<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(chat_identities::table)
            .values((
                chat_identities::provider.eq(&identity.provider),
                chat_identities::external_id.eq(&identity.external_id),
                chat_identities::uid.eq(identity.uid.as_deref()),
                chat_identities::followed.eq(identity.followed),
                chat_identities::last_seen_at.eq(identity.last_seen_at),
                chat_identities::updated_at.eq(identity.updated_at),
            ))
            .on_conflict((chat_identities::provider, chat_identities::external_id))
            .do_update()
            .set((
                chat_identities::uid.eq(identity.uid.as_deref()),
                chat_identities::followed.eq(identity.followed),
                chat_identities::last_seen_at.eq(identity.last_seen_at),
                chat_identities::updated_at.eq(identity.updated_at),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_chat_identity(
        &self,
        provider: &str,
        external_id: &str,
    ) -> EngineResult<Option<ChatIdentity>> {
        let mut conn = self.conn().await?;
        let row = chat_identities::table
            .find((provider, external_id))
            .select(ChatIdentityRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(row.map(ChatIdentityRow::into_domain))
    }

    async fn get_oauth_token(&self, provider: &str) -> EngineResult<Option<OAuthTokenRecord>> {
        let mut conn = self.conn().await?;
        let row = oauth_tokens::table
            .find(provider)
            .select(OAuthTokenRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(row.map(OAuthTokenRow::into_domain))
    }

    async fn upsert_oauth_token(&self, token: &OAuthTokenRecord) -> EngineResult<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(oauth_tokens::table)
            .values((
                oauth_tokens::provider.eq(&token.provider),
                oauth_tokens::access_token.eq(token.access_token.as_deref()),
                oauth_tokens::refresh_token.eq(token.refresh_token.as_deref()),
                oauth_tokens::expires_at.eq(token.expires_at),
                oauth_tokens::updated_at.eq(token.updated_at),
            ))
            .on_conflict(oauth_tokens::provider)
            .do_update()
            .set((
                oauth_tokens::access_token.eq(token.access_token.as_deref()),
                oauth_tokens::refresh_token.eq(token.refresh_token.as_deref()),
                oauth_tokens::expires_at.eq(token.expires_at),
                oauth_tokens::updated_at.eq(token.updated_at),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}
