use {
    crate::domain::{
        cache::{CacheFuture, IdempotencyCache, cache_key},
        error::PipelineError,
        event::EventKey,
        publisher::DomainEventPublisher,
        store::OutboxEntry,
    },
    redis::{AsyncCommands, aio::ConnectionManager},
    std::{future::Future, pin::Pin, time::Duration},
};

pub const ORDER_EVENTS_QUEUE: &str = "order-events";

fn cache_err(err: redis::RedisError) -> PipelineError {
    PipelineError::Cache(err.to_string())
}

pub async fn connect(url: &str) -> Result<ConnectionManager, PipelineError> {
    let client = redis::Client::open(url).map_err(cache_err)?;
    ConnectionManager::new(client).await.map_err(cache_err)
}

/// `SET webhook:done:{provider}:{id} 1 EX ttl` once an event completes.
#[derive(Clone)]
pub struct RedisIdempotencyCache {
    conn: ConnectionManager,
}

impl RedisIdempotencyCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

impl IdempotencyCache for RedisIdempotencyCache {
    fn is_completed<'a>(&'a self, key: &'a EventKey) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            conn.exists::<_, bool>(cache_key(key)).await.map_err(cache_err)
        })
    }

    fn remember_completed<'a>(&'a self, key: &'a EventKey, ttl: Duration) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            conn.set_ex::<_, _, ()>(cache_key(key), 1, ttl.as_secs().max(1))
                .await
                .map_err(cache_err)
        })
    }
}

/// Appends each outbox entry as JSON to the [`ORDER_EVENTS_QUEUE`] list.
/// Consumers pop with `LMOVE`/`BRPOPLPUSH`, so an entry survives until a
/// consumer takes it, even when none is connected at publish time.
#[derive(Clone)]
pub struct RedisEventPublisher {
    conn: ConnectionManager,
    queue: String,
}

impl RedisEventPublisher {
    pub fn new(conn: ConnectionManager) -> Self {
        Self::with_queue(conn, ORDER_EVENTS_QUEUE)
    }

    pub fn with_queue(conn: ConnectionManager, queue: impl Into<String>) -> Self {
        Self {
            conn,
            queue: queue.into(),
        }
    }
}

/// Wire form of one queued domain event: `{id, name, orderId, payload}`.
pub fn encode_message(entry: &OutboxEntry) -> Result<String, PipelineError> {
    let mut message = serde_json::to_value(&entry.event)?;
    message["id"] = entry.id.to_string().into();
    Ok(serde_json::to_string(&message)?)
}

impl DomainEventPublisher for RedisEventPublisher {
    fn publish<'a>(
        &'a self,
        entry: &'a OutboxEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let payload = encode_message(entry)?;

            let mut conn = self.conn.clone();
            let depth = conn
                .rpush::<_, _, i64>(&self.queue, payload)
                .await
                .map_err(|e| PipelineError::Storage(format!("enqueue failed: {e}")))?;
            if depth < 1 {
                return Err(PipelineError::Storage(format!(
                    "enqueue to {} not acknowledged",
                    self.queue
                )));
            }
            tracing::debug!(
                outbox_id = %entry.id,
                name = %entry.event.name,
                depth,
                "domain event queued"
            );
            Ok(())
        })
    }
}
