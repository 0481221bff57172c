use {
    crate::domain::{
        clock::Clock, error::PipelineError, publisher::DomainEventPublisher, store::PaymentStore,
    },
    std::{sync::Arc, time::Duration},
    tokio::sync::{Notify, watch},
};

const BATCH: i64 = 100;

/// Drains committed domain events to the publisher in commit order.
pub struct OutboxRelay {
    store: Arc<dyn PaymentStore>,
    publisher: Arc<dyn DomainEventPublisher>,
    clock: Arc<dyn Clock>,
    ready: Arc<Notify>,
    poll_interval: Duration,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        publisher: Arc<dyn DomainEventPublisher>,
        clock: Arc<dyn Clock>,
        ready: Arc<Notify>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
            ready,
            poll_interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("outbox relay started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("outbox relay shutting down");
                    return;
                }
                _ = self.ready.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            if let Err(e) = self.relay_once().await {
                tracing::error!(error = %e, "outbox relay error");
            }
        }
    }

    /// Publish pending rows oldest first. Stops at the first failure so a
    /// later event never overtakes an earlier one for the same order.
    pub async fn relay_once(&self) -> Result<usize, PipelineError> {
        let pending = self.store.pending_outbox(BATCH).await?;
        let mut published = 0;

        for entry in pending {
            match self.publisher.publish(&entry).await {
                Ok(()) => {
                    self.store
                        .mark_outbox_published(entry.id, self.clock.now())
                        .await?;
                    published += 1;
                    tracing::debug!(
                        outbox_id = %entry.id,
                        event = %entry.event.name,
                        order_id = %entry.event.order_id,
                        "domain event published"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        outbox_id = %entry.id,
                        attempts = entry.attempts + 1,
                        error = %e,
                        "publish failed, will retry"
                    );
                    self.store
                        .mark_outbox_failed(entry.id, &e.to_string())
                        .await?;
                    break;
                }
            }
        }
        Ok(published)
    }
}
