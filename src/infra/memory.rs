//! In-process implementations of the storage, cache, bus and alert seams.
//! Used by the test suite and for running without Postgres or Redis.

use {
    crate::domain::{
        alert::{Alert, AlertSink},
        cache::{CacheFuture, IdempotencyCache, cache_key},
        clock::Clock,
        error::PipelineError,
        event::{EventKey, EventOutcome, EventStatus, NewWebhookEvent, WebhookEvent},
        id::OrderId,
        payment::OrderPaymentState,
        publisher::DomainEventPublisher,
        store::{
            CommitOutcome, CommitTransition, InsertOutcome, LeaseToken, OutboxEntry, PaymentStore,
            StoreFuture,
        },
    },
    chrono::{DateTime, Utc},
    std::{
        collections::HashMap,
        future::Future,
        pin::Pin,
        sync::{
            Mutex as StdMutex,
            atomic::{AtomicBool, AtomicU32, Ordering},
        },
        time::Duration,
    },
    tokio::{sync::Mutex, time::Instant},
    uuid::Uuid,
};

#[derive(Default)]
struct Tables {
    events: HashMap<EventKey, WebhookEvent>,
    archive: Vec<WebhookEvent>,
    orders: HashMap<OrderId, OrderPaymentState>,
    outbox: Vec<OutboxRecord>,
}

#[derive(Clone)]
struct OutboxRecord {
    entry: OutboxEntry,
    published_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// One mutex over every table: the lock plays the part of both the unique
/// constraint and the transaction.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    commit_outage: AtomicBool,
    injected_conflicts: AtomicU32,
}

fn holds_lease(event: &WebhookEvent, lease: &LeaseToken) -> bool {
    event.status == EventStatus::Processing && event.attempt == lease.attempt
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_order(&self, state: OrderPaymentState) {
        self.tables
            .lock()
            .await
            .orders
            .insert(state.order_id.clone(), state);
    }

    pub async fn order(&self, order_id: &OrderId) -> Option<OrderPaymentState> {
        self.tables.lock().await.orders.get(order_id).cloned()
    }

    pub async fn event(&self, key: &EventKey) -> Option<WebhookEvent> {
        self.tables.lock().await.events.get(key).cloned()
    }

    pub async fn event_count(&self) -> usize {
        self.tables.lock().await.events.len()
    }

    pub async fn archived(&self) -> Vec<WebhookEvent> {
        self.tables.lock().await.archive.clone()
    }

    /// Every outbox entry ever enqueued, published or not.
    pub async fn outbox(&self) -> Vec<OutboxEntry> {
        let tables = self.tables.lock().await;
        tables.outbox.iter().map(|r| r.entry.clone()).collect()
    }

    /// Simulate a storage outage at the commit step.
    pub fn set_commit_outage(&self, down: bool) {
        self.commit_outage.store(down, Ordering::SeqCst);
    }

    /// Make the next `n` commits lose the version race.
    pub fn inject_version_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Move a row's lease start, as if it had been claimed at `claimed_at`.
    pub async fn backdate_claim(&self, key: &EventKey, claimed_at: DateTime<Utc>) {
        if let Some(event) = self.tables.lock().await.events.get_mut(key) {
            event.claimed_at = claimed_at;
        }
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl PaymentStore for MemoryStore {
    fn insert_processing(&self, event: NewWebhookEvent) -> StoreFuture<'_, InsertOutcome> {
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            if let Some(existing) = tables.events.get(&event.key) {
                return Ok(InsertOutcome::Existing(existing.clone()));
            }
            let row = WebhookEvent {
                key: event.key.clone(),
                event_type: event.event_type,
                status: EventStatus::Processing,
                outcome: None,
                attempt: 1,
                payload_digest: event.payload_digest,
                raw_body: event.raw_body,
                received_at: event.received_at,
                claimed_at: event.received_at,
                completed_at: None,
                last_error: None,
            };
            tables.events.insert(event.key, row.clone());
            Ok(InsertOutcome::Inserted(row))
        })
    }

    fn find_event<'a>(&'a self, key: &'a EventKey) -> StoreFuture<'a, Option<WebhookEvent>> {
        Box::pin(async move { Ok(self.tables.lock().await.events.get(key).cloned()) })
    }

    fn reclaim<'a>(
        &'a self,
        key: &'a EventKey,
        expected_attempt: i32,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Option<WebhookEvent>> {
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            let Some(event) = tables.events.get_mut(key) else {
                return Ok(None);
            };
            if event.status != EventStatus::Processing || event.attempt != expected_attempt {
                return Ok(None);
            }
            event.attempt += 1;
            event.claimed_at = now;
            Ok(Some(event.clone()))
        })
    }

    fn mark_completed<'a>(
        &'a self,
        lease: &'a LeaseToken,
        outcome: EventOutcome,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            match tables.events.get_mut(&lease.key) {
                Some(event) if holds_lease(event, lease) => {
                    event.status = EventStatus::Completed;
                    event.outcome = Some(outcome);
                    event.completed_at = Some(now);
                    event.last_error = None;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn mark_failed<'a>(
        &'a self,
        key: &'a EventKey,
        reason: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            if let Some(event) = tables.events.get_mut(key)
                && event.status == EventStatus::Processing
            {
                event.status = EventStatus::Failed;
                event.last_error = Some(reason.to_string());
                event.completed_at = Some(now);
            }
            Ok(())
        })
    }

    fn record_error<'a>(&'a self, lease: &'a LeaseToken, error: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            if let Some(event) = tables.events.get_mut(&lease.key)
                && holds_lease(event, lease)
            {
                event.last_error = Some(error.to_string());
            }
            Ok(())
        })
    }

    fn stale_processing(
        &self,
        claimed_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreFuture<'_, Vec<WebhookEvent>> {
        Box::pin(async move {
            let tables = self.tables.lock().await;
            let mut stale: Vec<WebhookEvent> = tables
                .events
                .values()
                .filter(|e| e.status == EventStatus::Processing && e.claimed_at < claimed_before)
                .cloned()
                .collect();
            stale.sort_by_key(|e| e.claimed_at);
            stale.truncate(usize::try_from(limit).unwrap_or(0));
            Ok(stale)
        })
    }

    fn archive_completed(&self, before: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            let expired: Vec<EventKey> = tables
                .events
                .values()
                .filter(|e| {
                    e.status == EventStatus::Completed && e.completed_at.is_some_and(|t| t < before)
                })
                .map(|e| e.key.clone())
                .collect();
            for key in &expired {
                if let Some(event) = tables.events.remove(key) {
                    tables.archive.push(event);
                }
            }
            Ok(expired.len() as u64)
        })
    }

    fn load_order<'a>(
        &'a self,
        order_id: &'a OrderId,
    ) -> StoreFuture<'a, Option<OrderPaymentState>> {
        Box::pin(async move { Ok(self.tables.lock().await.orders.get(order_id).cloned()) })
    }

    fn commit_transition<'a>(
        &'a self,
        commit: CommitTransition<'a>,
    ) -> StoreFuture<'a, CommitOutcome> {
        Box::pin(async move {
            if self.commit_outage.load(Ordering::SeqCst) {
                return Err(PipelineError::Storage("commit rejected: store offline".into()));
            }
            let mut tables = self.tables.lock().await;

            match tables.events.get(&commit.lease.key) {
                Some(event) if holds_lease(event, commit.lease) => {}
                _ => return Ok(CommitOutcome::LeaseLost),
            }

            let Some(current) = tables.orders.get(commit.order_id) else {
                return Err(PipelineError::OrderNotFound(commit.order_id.to_string()));
            };
            if current.version != commit.expected_version || self.take_injected_conflict() {
                return Ok(CommitOutcome::VersionConflict);
            }
            let next = commit.patch.apply_to(current, commit.now)?;
            let version = next.version;

            tables.orders.insert(commit.order_id.clone(), next);
            if let Some(event) = tables.events.get_mut(&commit.lease.key) {
                event.status = EventStatus::Completed;
                event.outcome = Some(EventOutcome::Applied);
                event.completed_at = Some(commit.now);
                event.last_error = None;
            }
            for event in commit.events {
                tables.outbox.push(OutboxRecord {
                    entry: OutboxEntry {
                        id: Uuid::now_v7(),
                        event,
                        attempts: 0,
                        created_at: commit.now,
                    },
                    published_at: None,
                    last_error: None,
                });
            }
            Ok(CommitOutcome::Applied { version })
        })
    }

    fn pending_outbox(&self, limit: i64) -> StoreFuture<'_, Vec<OutboxEntry>> {
        Box::pin(async move {
            let tables = self.tables.lock().await;
            Ok(tables
                .outbox
                .iter()
                .filter(|r| r.published_at.is_none())
                .take(usize::try_from(limit).unwrap_or(0))
                .map(|r| r.entry.clone())
                .collect())
        })
    }

    fn mark_outbox_published(&self, id: Uuid, now: DateTime<Utc>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            if let Some(record) = tables.outbox.iter_mut().find(|r| r.entry.id == id) {
                record.published_at = Some(now);
            }
            Ok(())
        })
    }

    fn mark_outbox_failed<'a>(&'a self, id: Uuid, error: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            if let Some(record) = tables.outbox.iter_mut().find(|r| r.entry.id == id) {
                record.entry.attempts += 1;
                record.last_error = Some(error.to_string());
            }
            Ok(())
        })
    }
}

/// TTL map keyed like the Redis cache.
#[derive(Default)]
pub struct MemoryCache {
    entries: StdMutex<HashMap<String, Instant>>,
    unavailable: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail, as an unreachable Redis would.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), PipelineError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PipelineError::Cache("connection refused".into()));
        }
        Ok(())
    }
}

impl IdempotencyCache for MemoryCache {
    fn is_completed<'a>(&'a self, key: &'a EventKey) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            self.check()?;
            let entries = self
                .entries
                .lock()
                .map_err(|_| PipelineError::Cache("poisoned".into()))?;
            Ok(entries
                .get(&cache_key(key))
                .is_some_and(|expires| *expires > Instant::now()))
        })
    }

    fn remember_completed<'a>(&'a self, key: &'a EventKey, ttl: Duration) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            self.entries
                .lock()
                .map_err(|_| PipelineError::Cache("poisoned".into()))?
                .insert(cache_key(key), Instant::now() + ttl);
            Ok(())
        })
    }
}

/// Publisher that keeps what it was given. Test double only; production
/// never wires it.
#[derive(Default)]
pub struct InMemoryEventBus {
    published: StdMutex<Vec<OutboxEntry>>,
    failing: AtomicBool,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<OutboxEntry> {
        self.published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn names_for(&self, order_id: &OrderId) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|e| &e.event.order_id == order_id)
            .map(|e| e.event.name)
            .collect()
    }
}

impl DomainEventPublisher for InMemoryEventBus {
    fn publish<'a>(
        &'a self,
        entry: &'a OutboxEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(PipelineError::Storage("bus unavailable".into()));
            }
            self.published
                .lock()
                .map_err(|_| PipelineError::Storage("bus poisoned".into()))?
                .push(entry.clone());
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct MemoryAlertSink {
    alerts: StdMutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl AlertSink for MemoryAlertSink {
    fn fire(&self, alert: Alert) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if let Ok(mut alerts) = self.alerts.lock() {
                alerts.push(alert);
            }
        })
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: StdMutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: StdMutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }
}
