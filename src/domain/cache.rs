use {
    super::error::PipelineError,
    super::event::EventKey,
    std::{future::Future, pin::Pin, time::Duration},
};

pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, PipelineError>> + Send + 'a>>;

/// Short-TTL record of completed events. A latency optimization in front of
/// the event store, never the source of truth: callers treat any error as a
/// miss.
pub trait IdempotencyCache: Send + Sync {
    fn is_completed<'a>(&'a self, key: &'a EventKey) -> CacheFuture<'a, bool>;

    fn remember_completed<'a>(&'a self, key: &'a EventKey, ttl: Duration) -> CacheFuture<'a, ()>;
}

pub fn cache_key(key: &EventKey) -> String {
    format!("webhook:done:{}:{}", key.provider.as_str(), key.event_id.as_str())
}
