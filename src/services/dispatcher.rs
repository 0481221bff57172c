use {
    crate::domain::{
        clock::Clock,
        error::PipelineError,
        id::OrderId,
        state_machine::Transition,
        store::{CommitOutcome, CommitTransition, LeaseToken, PaymentStore},
    },
    std::sync::Arc,
    tokio::sync::Notify,
};

/// Executes a transition's effects as one unit of work: the versioned order
/// write, the event's completion and the outbox rows commit together.
pub struct EffectDispatcher {
    store: Arc<dyn PaymentStore>,
    clock: Arc<dyn Clock>,
    outbox_ready: Arc<Notify>,
}

impl EffectDispatcher {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        clock: Arc<dyn Clock>,
        outbox_ready: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            clock,
            outbox_ready,
        }
    }

    pub async fn apply(
        &self,
        lease: &LeaseToken,
        order_id: &OrderId,
        expected_version: i64,
        transition: &Transition,
    ) -> Result<CommitOutcome, PipelineError> {
        let events: Vec<_> = transition.domain_events().cloned().collect();
        let has_events = !events.is_empty();

        let outcome = self
            .store
            .commit_transition(CommitTransition {
                lease,
                order_id,
                expected_version,
                patch: transition.patch()?,
                events,
                now: self.clock.now(),
            })
            .await?;

        // Emission happens only after the commit is durable.
        if has_events && matches!(outcome, CommitOutcome::Applied { .. }) {
            self.outbox_ready.notify_one();
        }
        Ok(outcome)
    }
}
