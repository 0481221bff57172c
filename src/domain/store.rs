use {
    super::error::PipelineError,
    super::event::{EventKey, EventOutcome, NewWebhookEvent, WebhookEvent},
    super::id::OrderId,
    super::payment::{OrderPatch, OrderPaymentState},
    super::state_machine::DomainEvent,
    chrono::{DateTime, Utc},
    std::{future::Future, pin::Pin},
    uuid::Uuid,
};

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, PipelineError>> + Send + 'a>>;

#[derive(Debug)]
pub enum InsertOutcome {
    /// Row created with `status = processing`, `attempt = 1`.
    Inserted(WebhookEvent),
    /// Unique constraint hit; the row that won.
    Existing(WebhookEvent),
}

/// Proof of the current lease on an event row, used to fence writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub key: EventKey,
    pub attempt: i32,
}

#[derive(Debug)]
pub struct CommitTransition<'a> {
    pub lease: &'a LeaseToken,
    pub order_id: &'a OrderId,
    pub expected_version: i64,
    pub patch: OrderPatch,
    pub events: Vec<DomainEvent>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied { version: i64 },
    VersionConflict,
    /// The lease was reclaimed by someone else; nothing was written.
    LeaseLost,
}

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub event: DomainEvent,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

/// Durable storage for webhook events, order payment state and the
/// domain-event outbox. `insert_processing` is the only linearization point
/// for concurrent duplicate deliveries.
pub trait PaymentStore: Send + Sync {
    fn insert_processing(&self, event: NewWebhookEvent) -> StoreFuture<'_, InsertOutcome>;

    fn find_event<'a>(&'a self, key: &'a EventKey) -> StoreFuture<'a, Option<WebhookEvent>>;

    /// Compare-and-swap on `attempt`: bump it and restart the lease.
    /// Returns the new row, or `None` if another caller reclaimed first.
    fn reclaim<'a>(
        &'a self,
        key: &'a EventKey,
        expected_attempt: i32,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Option<WebhookEvent>>;

    /// Complete without an order write. `false` if the lease was lost.
    fn mark_completed<'a>(
        &'a self,
        lease: &'a LeaseToken,
        outcome: EventOutcome,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool>;

    fn mark_failed<'a>(
        &'a self,
        key: &'a EventKey,
        reason: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, ()>;

    /// Record the last transient error without giving up the lease.
    fn record_error<'a>(&'a self, lease: &'a LeaseToken, error: &'a str) -> StoreFuture<'a, ()>;

    fn stale_processing(
        &self,
        claimed_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreFuture<'_, Vec<WebhookEvent>>;

    /// Move completed rows older than `before` to the archive.
    fn archive_completed(&self, before: DateTime<Utc>) -> StoreFuture<'_, u64>;

    fn load_order<'a>(&'a self, order_id: &'a OrderId)
    -> StoreFuture<'a, Option<OrderPaymentState>>;

    /// One unit of work: CAS on order `version`, complete the event under the
    /// lease, enqueue outbox rows.
    fn commit_transition<'a>(
        &'a self,
        commit: CommitTransition<'a>,
    ) -> StoreFuture<'a, CommitOutcome>;

    fn pending_outbox(&self, limit: i64) -> StoreFuture<'_, Vec<OutboxEntry>>;

    fn mark_outbox_published(&self, id: Uuid, now: DateTime<Utc>) -> StoreFuture<'_, ()>;

    fn mark_outbox_failed<'a>(&'a self, id: Uuid, error: &'a str) -> StoreFuture<'a, ()>;
}
