use {
    super::error::PipelineError,
    super::store::OutboxEntry,
    std::{future::Future, pin::Pin},
};

/// Delivers committed domain events to downstream consumers (fulfillment,
/// inventory, notifications). At-least-once: consumers tolerate duplicates.
pub trait DomainEventPublisher: Send + Sync {
    fn publish<'a>(
        &'a self,
        entry: &'a OutboxEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>>;
}
