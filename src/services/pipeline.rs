use {
    super::{
        dispatcher::EffectDispatcher,
        idempotency::{Acquire, IdempotencyGuard},
        telemetry::Telemetry,
    },
    crate::{
        config::{DispatchConfig, GuardConfig},
        domain::{
            alert::AlertSink,
            cache::IdempotencyCache,
            clock::Clock,
            error::PipelineError,
            event::{EventOutcome, NormalizedEvent},
            state_machine,
            store::{CommitOutcome, LeaseToken, PaymentStore},
        },
    },
    rand::Rng,
    std::{sync::Arc, time::Duration},
    tokio::{sync::Notify, time::Instant},
};

/// What happened to one delivery. All of these are acknowledged to the
/// provider except `InFlight`, whose response depends on the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Applied,
    NoOp,
    Illegal,
    Ignored,
    Duplicate,
    InFlight,
    Escalated,
}

impl ProcessOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::NoOp => "noop",
            Self::Illegal => "illegal",
            Self::Ignored => "ignored",
            Self::Duplicate => "duplicate",
            Self::InFlight => "in_flight",
            Self::Escalated => "escalated",
        }
    }
}

/// Shared collaborators, wired once in `main` (or a test harness).
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: Arc<dyn PaymentStore>,
    pub cache: Option<Arc<dyn IdempotencyCache>>,
    pub alerts: Arc<dyn AlertSink>,
    pub clock: Arc<dyn Clock>,
    pub telemetry: Arc<Telemetry>,
    pub outbox_ready: Arc<Notify>,
}

pub struct Pipeline {
    guard: IdempotencyGuard,
    dispatcher: EffectDispatcher,
    store: Arc<dyn PaymentStore>,
    telemetry: Arc<Telemetry>,
    dispatch: DispatchConfig,
}

impl Pipeline {
    pub fn new(deps: PipelineDeps, guard: GuardConfig, dispatch: DispatchConfig) -> Self {
        Self {
            guard: IdempotencyGuard::new(
                deps.store.clone(),
                deps.cache,
                deps.alerts,
                deps.clock.clone(),
                deps.telemetry.clone(),
                guard,
            ),
            dispatcher: EffectDispatcher::new(deps.store.clone(), deps.clock, deps.outbox_ready),
            store: deps.store,
            telemetry: deps.telemetry,
            dispatch,
        }
    }

    pub fn guard(&self) -> &IdempotencyGuard {
        &self.guard
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Entry point for a verified delivery.
    #[tracing::instrument(
        name = "pipeline",
        skip_all,
        fields(
            provider = %event.provider,
            event_id = %event.provider_event_id,
            kind = %event.kind,
            order_id = tracing::field::Empty,
        )
    )]
    pub async fn handle(
        &self,
        event: &NormalizedEvent,
        raw_body: &[u8],
    ) -> Result<ProcessOutcome, PipelineError> {
        if let Some(order_id) = &event.order_id {
            tracing::Span::current().record("order_id", tracing::field::display(order_id));
        }
        let started = Instant::now();

        let result = match self.guard.acquire(event, raw_body).await {
            Ok(Acquire::Lease(lease)) => self.run_lease(&lease, event).await,
            Ok(Acquire::AlreadyCompleted) => Ok(ProcessOutcome::Duplicate),
            Ok(Acquire::AlreadyProcessing) => Ok(ProcessOutcome::InFlight),
            Ok(Acquire::Escalated { .. }) => Ok(ProcessOutcome::Escalated),
            Err(e) => Err(e),
        };

        self.record(event, &result, started);
        result
    }

    fn record(
        &self,
        event: &NormalizedEvent,
        result: &Result<ProcessOutcome, PipelineError>,
        started: Instant,
    ) {
        let status = match result {
            Ok(outcome) => outcome.as_str(),
            Err(_) => "error",
        };
        self.telemetry
            .record_processed(event.provider, status, started.elapsed());
    }

    /// Drive a held lease to completion. Errors leave the row `processing`
    /// for the Supervisor.
    pub async fn run_lease(
        &self,
        lease: &LeaseToken,
        event: &NormalizedEvent,
    ) -> Result<ProcessOutcome, PipelineError> {
        let result = self.process(lease, event).await;
        if let Err(e) = &result {
            tracing::warn!(
                attempt = lease.attempt,
                error = %e,
                "processing failed, leaving event in processing"
            );
            if let Err(record_err) = self.store.record_error(lease, &e.to_string()).await {
                tracing::warn!(error = %record_err, "could not record processing error");
            }
        }
        result
    }

    async fn process(
        &self,
        lease: &LeaseToken,
        event: &NormalizedEvent,
    ) -> Result<ProcessOutcome, PipelineError> {
        let Some(order_id) = event.order_id.as_ref().filter(|_| event.is_actionable())
        else {
            tracing::debug!(event_type = %event.event_type, "nothing to act on");
            return self.finish(lease, EventOutcome::Ignored, ProcessOutcome::Ignored).await;
        };

        let max = self.dispatch.max_conflict_retries;
        for retry in 0..=max {
            let state = self
                .store
                .load_order(order_id)
                .await?
                .ok_or_else(|| PipelineError::OrderNotFound(order_id.to_string()))?;

            let transition = match state_machine::transition(state.status, event) {
                Ok(t) => t,
                Err(illegal) => {
                    tracing::warn!(
                        from = %illegal.from,
                        kind = %illegal.kind,
                        version = state.version,
                        "illegal transition, acknowledging without change"
                    );
                    self.telemetry.record_illegal(event.provider);
                    return self.finish(lease, EventOutcome::Illegal, ProcessOutcome::Illegal).await;
                }
            };
            if transition.is_noop() {
                return self.finish(lease, EventOutcome::Noop, ProcessOutcome::NoOp).await;
            }

            match self
                .dispatcher
                .apply(lease, order_id, state.version, &transition)
                .await?
            {
                CommitOutcome::Applied { version } => {
                    tracing::info!(
                        from = %transition.from,
                        to = %transition.next,
                        version,
                        attempt = lease.attempt,
                        "transition applied"
                    );
                    self.guard.remember(&lease.key).await;
                    return Ok(ProcessOutcome::Applied);
                }
                CommitOutcome::LeaseLost => {
                    tracing::warn!(attempt = lease.attempt, "lease lost before commit");
                    return Ok(ProcessOutcome::InFlight);
                }
                CommitOutcome::VersionConflict => {
                    tracing::debug!(
                        retry,
                        version = state.version,
                        "version conflict, re-reading order"
                    );
                    if retry < max {
                        tokio::time::sleep(backoff(self.dispatch.conflict_backoff, retry)).await;
                    }
                }
            }
        }

        Err(PipelineError::Contention {
            order_id: order_id.to_string(),
            attempts: max + 1,
        })
    }

    async fn finish(
        &self,
        lease: &LeaseToken,
        outcome: EventOutcome,
        processed: ProcessOutcome,
    ) -> Result<ProcessOutcome, PipelineError> {
        if self.guard.complete(lease, outcome).await? {
            Ok(processed)
        } else {
            tracing::warn!(attempt = lease.attempt, "lease lost before completion");
            Ok(ProcessOutcome::InFlight)
        }
    }
}

/// Exponential from `base`, plus up to `base` of jitter.
fn backoff(base: Duration, retry: u32) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX).max(1);
    let exp = base_ms.saturating_mul(1 << retry.min(6));
    let jitter = rand::thread_rng().gen_range(0..=base_ms);
    Duration::from_millis(exp.saturating_add(jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let base = Duration::from_millis(25);
        let first = backoff(base, 0);
        assert!(first >= base && first <= base * 2);
        let third = backoff(base, 2);
        assert!(third >= base * 4 && third <= base * 5);
        assert!(backoff(base, 30) <= base * 65);
    }
}
