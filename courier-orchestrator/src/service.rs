use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use courier_core::config::DispatchConfig;
use courier_core::quiet_hours::{is_quiet, quiet_until, resolve_tz};
use courier_core::store::DynStore;
use courier_core::template::render_message;
use courier_core::types::{
    delivery_id, Channel, Delivery, DeliveryStatus, JobStatus, MessagePayload, NotificationJob,
    OutboxPayload, SendTarget, Template, UserPreference, WorkerRequest, DEFAULT_CHANNELS,
};
use courier_workers::Dispatcher;

use crate::audience::AudienceResolvers;

/// Turns one notification job into per-recipient, per-channel work: the
/// in-app channel is delivered on the spot, every provider channel becomes a
/// durable outbox item for the sweeper.
pub struct Orchestrator {
    store: DynStore,
    dispatcher: Arc<Dispatcher>,
    resolvers: AudienceResolvers,
    dispatch: DispatchConfig,
}

impl Orchestrator {
    pub fn new(
        store: DynStore,
        dispatcher: Arc<Dispatcher>,
        resolvers: AudienceResolvers,
        dispatch: DispatchConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            resolvers,
            dispatch,
        }
    }

    pub async fn process_job(&self, job_id: &str) -> Result<()> {
        let Some(job) = self.store.get_job(job_id).await? else {
            tracing::warn!("Job {} not found, dropping event", job_id);
            return Ok(());
        };

        let Some(template) = self.store.get_template(&job.template_id).await? else {
            tracing::warn!("Template {} missing for job {}", job.template_id, job.id);
            self.store
                .set_job_status(&job.id, JobStatus::Failed, Some("template_not_found"))
                .await?;
            return Ok(());
        };

        let channels = select_channels(&job, &template);
        let recipients = self.resolvers.resolve(&job.audience);
        let action_url = job
            .data
            .get("actionUrl")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        for uid in &recipients {
            let Some(pref) = self.store.get_preference(uid).await? else {
                tracing::debug!("No preference record for {}, skipping", uid);
                continue;
            };
            let payload = render_message(
                &template,
                &pref.language,
                &self.dispatch.default_language,
                &job.data,
                action_url.clone(),
            );
            self.dispatch_recipient(&job, &pref, &channels, &payload)
                .await?;
        }

        let status = if self.dispatch.complete_dispatched_jobs {
            JobStatus::Done
        } else {
            JobStatus::Processing
        };
        self.store.set_job_status(&job.id, status, None).await?;

        tracing::debug!(
            "Dispatched job {} to {} recipient(s) across {:?}",
            job.id,
            recipients.len(),
            channels
        );
        Ok(())
    }

    async fn dispatch_recipient(
        &self,
        job: &NotificationJob,
        pref: &UserPreference,
        channels: &[Channel],
        payload: &MessagePayload,
    ) -> Result<()> {
        let now = Utc::now();
        let tz = resolve_tz(&pref.timezone, &self.dispatch.default_timezone);
        let deferred_until = pref
            .quiet_hours
            .as_ref()
            .filter(|qh| is_quiet(Some(qh), tz, now))
            .map(|qh| quiet_until(qh, tz, now));

        for &channel in channels {
            if channel == Channel::Inapp {
                // In-app ignores quiet hours: it lands in the user's inbox,
                // it does not wake anyone up.
                let req = WorkerRequest {
                    job_id: job.id.clone(),
                    uid: Some(pref.uid.clone()),
                    payload: payload.clone(),
                    target: None,
                    topic: job.topic.clone(),
                };
                if let Err(e) = self.dispatcher.dispatch(Channel::Inapp, &req).await {
                    tracing::error!(
                        "In-app delivery for job {} user {} failed: {}",
                        job.id,
                        pref.uid,
                        e
                    );
                }
                continue;
            }

            let Some(target) = SendTarget::from_contact(channel, &pref.contact, job.topic.as_deref())
            else {
                continue;
            };
            let item = OutboxPayload {
                payload: payload.clone(),
                target,
                topic: job.topic.clone(),
            };
            let due_at = match deferred_until {
                Some(until) => {
                    // The ledger shows the deferred send right away; the
                    // worker overwrites this row once the window ends.
                    self.store
                        .seed_delivery(&pending_row(job, &pref.uid, channel, now))
                        .await?;
                    tracing::debug!(
                        "Quiet hours for {}: deferring {} on job {} until {}",
                        pref.uid,
                        channel,
                        job.id,
                        until
                    );
                    until
                }
                None => now,
            };
            self.store
                .enqueue_outbox(&job.id, &pref.uid, channel, &item, due_at)
                .await?;
        }
        Ok(())
    }
}

/// Channel set precedence: the job's explicit list, then the template's,
/// then the built-in default. Duplicates collapse, order is preserved.
fn select_channels(job: &NotificationJob, template: &Template) -> Vec<Channel> {
    let source = job
        .required_channels
        .clone()
        .filter(|c| !c.is_empty())
        .or_else(|| (!template.channels.is_empty()).then(|| template.channels.clone()))
        .unwrap_or_else(|| DEFAULT_CHANNELS.to_vec());

    let mut channels = Vec::with_capacity(source.len());
    for channel in source {
        if !channels.contains(&channel) {
            channels.push(channel);
        }
    }
    channels
}

fn pending_row(
    job: &NotificationJob,
    uid: &str,
    channel: Channel,
    now: chrono::DateTime<Utc>,
) -> Delivery {
    Delivery {
        id: delivery_id(&job.id, channel, uid),
        job_id: job.id.clone(),
        uid: Some(uid.to_string()),
        channel,
        status: DeliveryStatus::Pending,
        provider: None,
        provider_message_id: None,
        error_code: None,
        error_message: None,
        attempts: 0,
        meta: None,
        events: vec![],
        created_at: now,
        sent_at: None,
        delivered_at: None,
        read_at: None,
    }
}
