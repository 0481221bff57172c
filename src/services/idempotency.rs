//! Decides whether a delivery may proceed to the state machine.
//!
//! The cache answers "already completed" quickly; the event store's unique
//! constraint decides everything else. Any cache failure is a miss.

use {
    super::telemetry::Telemetry,
    crate::{
        config::GuardConfig,
        domain::{
            alert::{Alert, AlertKind, AlertSeverity, AlertSink},
            cache::IdempotencyCache,
            clock::Clock,
            error::PipelineError,
            event::{
                EventKey, EventOutcome, EventStatus, NewWebhookEvent, NormalizedEvent, WebhookEvent,
            },
            store::{InsertOutcome, LeaseToken, PaymentStore},
        },
    },
    chrono::{DateTime, Utc},
    std::sync::Arc,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    /// Caller owns the event until it completes or the lease times out.
    Lease(LeaseToken),
    AlreadyCompleted,
    AlreadyProcessing,
    /// Attempts are used up; the row is `failed` and an operator was alerted.
    Escalated { attempt: i32 },
}

pub struct IdempotencyGuard {
    store: Arc<dyn PaymentStore>,
    cache: Option<Arc<dyn IdempotencyCache>>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<Telemetry>,
    config: GuardConfig,
}

impl IdempotencyGuard {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        cache: Option<Arc<dyn IdempotencyCache>>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<Telemetry>,
        config: GuardConfig,
    ) -> Self {
        Self {
            store,
            cache,
            alerts,
            clock,
            telemetry,
            config,
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub async fn acquire(
        &self,
        event: &NormalizedEvent,
        raw_body: &[u8],
    ) -> Result<Acquire, PipelineError> {
        let key = event.key();
        if self.cached_completed(&key).await {
            return Ok(Acquire::AlreadyCompleted);
        }

        let now = self.clock.now();
        let new_row = NewWebhookEvent::from_normalized(event, raw_body, now);
        match self.store.insert_processing(new_row).await? {
            InsertOutcome::Inserted(row) => Ok(Acquire::Lease(LeaseToken {
                key,
                attempt: row.attempt,
            })),
            InsertOutcome::Existing(row) => self.resolve_existing(row, now).await,
        }
    }

    /// Decide what a row that already exists means for this caller. Also the
    /// Supervisor's entry point for abandoned rows.
    pub async fn resolve_existing(
        &self,
        row: WebhookEvent,
        now: DateTime<Utc>,
    ) -> Result<Acquire, PipelineError> {
        match row.status {
            EventStatus::Completed => {
                self.remember(&row.key).await;
                Ok(Acquire::AlreadyCompleted)
            }
            EventStatus::Failed => Ok(Acquire::Escalated {
                attempt: row.attempt,
            }),
            EventStatus::Processing if !self.lease_expired(&row, now) => {
                Ok(Acquire::AlreadyProcessing)
            }
            EventStatus::Processing if row.attempt >= self.config.max_attempts => {
                self.escalate(&row, now).await?;
                Ok(Acquire::Escalated {
                    attempt: row.attempt,
                })
            }
            EventStatus::Processing => {
                match self.store.reclaim(&row.key, row.attempt, now).await? {
                    Some(reclaimed) => {
                        tracing::info!(
                            provider = %row.key.provider,
                            event_id = %row.key.event_id,
                            attempt = reclaimed.attempt,
                            "reclaimed abandoned event"
                        );
                        Ok(Acquire::Lease(LeaseToken {
                            key: row.key,
                            attempt: reclaimed.attempt,
                        }))
                    }
                    // Someone else reclaimed it between our read and CAS.
                    None => Ok(Acquire::AlreadyProcessing),
                }
            }
        }
    }

    fn lease_expired(&self, row: &WebhookEvent, now: DateTime<Utc>) -> bool {
        let held_for = (now - row.claimed_at).to_std().unwrap_or_default();
        held_for >= self.config.processing_timeout
    }

    /// Complete without an order write. Returns `false` if the lease was lost.
    pub async fn complete(
        &self,
        lease: &LeaseToken,
        outcome: EventOutcome,
    ) -> Result<bool, PipelineError> {
        let done = self
            .store
            .mark_completed(lease, outcome, self.clock.now())
            .await?;
        if done {
            self.remember(&lease.key).await;
        }
        Ok(done)
    }

    /// Mark `failed` and page someone.
    pub async fn escalate(
        &self,
        row: &WebhookEvent,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let reason = row
            .last_error
            .clone()
            .unwrap_or_else(|| "processing attempts exhausted".to_string());
        self.store.mark_failed(&row.key, &reason, now).await?;
        self.telemetry.record_exhausted(row.key.provider);

        self.alerts
            .fire(Alert {
                kind: AlertKind::RetriesExhausted,
                severity: AlertSeverity::Critical,
                key: row.key.clone(),
                attempt: row.attempt,
                received_at: row.received_at,
                message: format!(
                    "webhook {} failed after {} attempts: {reason}",
                    row.key, row.attempt
                ),
            })
            .await;
        Ok(())
    }

    pub async fn remember(&self, key: &EventKey) {
        let Some(cache) = &self.cache else {
            return;
        };
        if let Err(e) = cache.remember_completed(key, self.config.cache_ttl).await {
            tracing::warn!(event = %key, error = %e, "idempotency cache write failed");
        }
    }

    async fn cached_completed(&self, key: &EventKey) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        match cache.is_completed(key).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(
                    event = %key,
                    error = %e,
                    "idempotency cache read failed, using store"
                );
                false
            }
        }
    }
}
