use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};

use courier_core::config::{DispatchConfig, SweepConfig};
use courier_core::context::EngineContext;
use courier_core::quiet_hours::{is_quiet, quiet_until, resolve_tz};
use courier_core::store::DynStore;
use courier_core::types::{OutboxItem, WorkerRequest};
use courier_core::EngineResult;
use courier_workers::Dispatcher;

/// Drains due outbox items through the channel workers. Terminal verdicts
/// (sent, failed, skipped) complete the item; only attempts that produced no
/// verdict are rescheduled, with the delay doubling per attempt until the
/// item is marked dead at the attempt cap.
pub struct Sweeper {
    store: DynStore,
    dispatcher: Arc<Dispatcher>,
    sweep: SweepConfig,
    dispatch: DispatchConfig,
}

pub async fn run(ctx: EngineContext, dispatcher: Arc<Dispatcher>) -> Result<()> {
    tracing::info!("Starting outbox sweeper");

    let sweeper = Sweeper::new(
        ctx.store.clone(),
        dispatcher,
        ctx.config.sweep.clone(),
        ctx.config.dispatch.clone(),
    );
    let idle = Duration::from_secs(ctx.config.sweep.poll_interval_secs.max(1));

    loop {
        match sweeper.sweep_due(Utc::now()).await {
            // A full batch means more is waiting: poll again without idling.
            Ok(count) if count as i64 >= ctx.config.sweep.batch_size => {}
            Ok(_) => tokio::time::sleep(idle).await,
            Err(e) => {
                tracing::error!("Error in outbox sweeper: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

impl Sweeper {
    pub fn new(
        store: DynStore,
        dispatcher: Arc<Dispatcher>,
        sweep: SweepConfig,
        dispatch: DispatchConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            sweep,
            dispatch,
        }
    }

    /// One polling pass. Returns how many items were picked up.
    pub async fn sweep_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.due_outbox(now, self.sweep.batch_size).await?;
        if due.is_empty() {
            return Ok(0);
        }
        tracing::debug!("Found {} due outbox items", due.len());

        let count = due.len();
        for item in due {
            // One stuck item must not block the rest of the batch.
            if let Err(e) = self.sweep_item(&item, now).await {
                tracing::error!("Failed to process outbox item {}: {}", item.id, e);
            }
        }
        Ok(count)
    }

    async fn sweep_item(&self, item: &OutboxItem, now: DateTime<Utc>) -> Result<()> {
        // The recipient may have entered quiet hours since the item was
        // scheduled; re-check before every send.
        if let Some(until) = self.quiet_deferral(item, now).await? {
            tracing::debug!(
                "Quiet hours for {}: deferring outbox item {} until {}",
                item.uid,
                item.id,
                until
            );
            self.store.defer_outbox(item.id, until).await?;
            return Ok(());
        }

        let request = worker_request(item);
        match self.dispatcher.dispatch(item.channel, &request).await {
            Ok(outcome) if outcome.retryable => {
                let error = outcome
                    .result
                    .error_message
                    .as_deref()
                    .unwrap_or("send failed");
                self.reschedule(item, now, error).await
            }
            Ok(outcome) => {
                tracing::debug!(
                    "Outbox item {} settled as {:?} on {}",
                    item.id,
                    outcome.result.status,
                    item.channel
                );
                self.store.complete_outbox(item.id).await?;
                Ok(())
            }
            // No verdict at all. Treated like a failed attempt so a poisoned
            // item runs into the cap instead of spinning forever.
            Err(e) => self.reschedule(item, now, &e.to_string()).await,
        }
    }

    async fn reschedule(&self, item: &OutboxItem, now: DateTime<Utc>, error: &str) -> Result<()> {
        let attempts = item.attempts + 1;
        if attempts >= self.sweep.max_attempts {
            tracing::warn!(
                "Outbox item {} dead after {} attempts: {}",
                item.id,
                attempts,
                error
            );
            self.store.mark_outbox_dead(item.id, error).await?;
        } else {
            let next = now + backoff(&self.sweep, item.attempts);
            tracing::debug!(
                "Outbox item {} attempt {} failed, next try at {}: {}",
                item.id,
                attempts,
                next,
                error
            );
            self.store.retry_outbox(item.id, next, error).await?;
        }
        Ok(())
    }

    async fn quiet_deferral(
        &self,
        item: &OutboxItem,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<DateTime<Utc>>> {
        let Some(pref) = self.store.get_preference(&item.uid).await? else {
            return Ok(None);
        };
        let Some(quiet) = pref.quiet_hours.as_ref() else {
            return Ok(None);
        };
        let tz = resolve_tz(&pref.timezone, &self.dispatch.default_timezone);
        if is_quiet(Some(quiet), tz, now) {
            return Ok(Some(quiet_until(quiet, tz, now)));
        }
        Ok(None)
    }
}

/// Outbox items carry the typed target; workers take the loose request
/// shape.
fn worker_request(item: &OutboxItem) -> WorkerRequest {
    WorkerRequest {
        job_id: item.job_id.clone(),
        uid: (!item.uid.is_empty()).then(|| item.uid.clone()),
        payload: item.payload.payload.clone(),
        target: Some(item.payload.target.to_request_value()),
        topic: item.payload.topic.clone(),
    }
}

/// Delay before the next try: the base doubled once per prior attempt,
/// capped.
fn backoff(sweep: &SweepConfig, prior_attempts: i32) -> chrono::Duration {
    let doublings = prior_attempts.clamp(0, 20) as u32;
    let secs = sweep
        .backoff_base_secs
        .saturating_mul(1i64 << doublings)
        .min(sweep.backoff_cap_secs);
    chrono::Duration::seconds(secs.max(1))
}
