pub mod event_repo;
pub mod order_repo;
pub mod outbox_repo;

use {
    crate::domain::{
        error::PipelineError,
        event::{EventKey, EventOutcome, NewWebhookEvent, WebhookEvent},
        id::OrderId,
        payment::OrderPaymentState,
        store::{
            CommitOutcome, CommitTransition, InsertOutcome, LeaseToken, OutboxEntry, PaymentStore,
            StoreFuture,
        },
    },
    chrono::{DateTime, Utc},
    sqlx::PgPool,
    uuid::Uuid,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert_order(&self, state: &OrderPaymentState) -> Result<(), PipelineError> {
        order_repo::insert(&self.pool, state).await
    }

    async fn commit(&self, commit: CommitTransition<'_>) -> Result<CommitOutcome, PipelineError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SET LOCAL lock_timeout = '5s'")
            .execute(&mut *tx)
            .await?;

        // Fence first: a worker whose lease was reclaimed writes nothing.
        let held = event_repo::complete_under_lease(
            &mut tx,
            commit.lease,
            EventOutcome::Applied,
            commit.now,
        )
        .await?;
        if !held {
            tx.rollback().await?;
            return Ok(CommitOutcome::LeaseLost);
        }

        let Some(version) = order_repo::apply_patch(
            &mut tx,
            commit.order_id,
            commit.expected_version,
            &commit.patch,
            commit.now,
        )
        .await?
        else {
            tx.rollback().await?;
            return Ok(CommitOutcome::VersionConflict);
        };

        for event in &commit.events {
            outbox_repo::enqueue(&mut tx, event, commit.now).await?;
        }

        tx.commit().await?;
        Ok(CommitOutcome::Applied { version })
    }
}

impl PaymentStore for PgStore {
    fn insert_processing(&self, event: NewWebhookEvent) -> StoreFuture<'_, InsertOutcome> {
        Box::pin(async move {
            if let Some(row) = event_repo::insert_processing(&self.pool, &event).await? {
                return Ok(InsertOutcome::Inserted(row));
            }
            // Lost the unique-constraint race; report whoever won.
            event_repo::find(&self.pool, &event.key)
                .await?
                .map(InsertOutcome::Existing)
                .ok_or_else(|| {
                    PipelineError::Storage(format!("event {} vanished after conflict", event.key))
                })
        })
    }

    fn find_event<'a>(&'a self, key: &'a EventKey) -> StoreFuture<'a, Option<WebhookEvent>> {
        Box::pin(event_repo::find(&self.pool, key))
    }

    fn reclaim<'a>(
        &'a self,
        key: &'a EventKey,
        expected_attempt: i32,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Option<WebhookEvent>> {
        Box::pin(event_repo::reclaim(&self.pool, key, expected_attempt, now))
    }

    fn mark_completed<'a>(
        &'a self,
        lease: &'a LeaseToken,
        outcome: EventOutcome,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await?;
            event_repo::complete_under_lease(&mut conn, lease, outcome, now).await
        })
    }

    fn mark_failed<'a>(
        &'a self,
        key: &'a EventKey,
        reason: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(event_repo::mark_failed(&self.pool, key, reason, now))
    }

    fn record_error<'a>(&'a self, lease: &'a LeaseToken, error: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(event_repo::record_error(&self.pool, lease, error))
    }

    fn stale_processing(
        &self,
        claimed_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreFuture<'_, Vec<WebhookEvent>> {
        Box::pin(event_repo::stale_processing(&self.pool, claimed_before, limit))
    }

    fn archive_completed(&self, before: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(event_repo::archive_completed(&self.pool, before))
    }

    fn load_order<'a>(
        &'a self,
        order_id: &'a OrderId,
    ) -> StoreFuture<'a, Option<OrderPaymentState>> {
        Box::pin(order_repo::load(&self.pool, order_id))
    }

    fn commit_transition<'a>(
        &'a self,
        commit: CommitTransition<'a>,
    ) -> StoreFuture<'a, CommitOutcome> {
        Box::pin(self.commit(commit))
    }

    fn pending_outbox(&self, limit: i64) -> StoreFuture<'_, Vec<OutboxEntry>> {
        Box::pin(outbox_repo::pending(&self.pool, limit))
    }

    fn mark_outbox_published(&self, id: Uuid, now: DateTime<Utc>) -> StoreFuture<'_, ()> {
        Box::pin(outbox_repo::mark_published(&self.pool, id, now))
    }

    fn mark_outbox_failed<'a>(&'a self, id: Uuid, error: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(outbox_repo::mark_failed(&self.pool, id, error))
    }
}
