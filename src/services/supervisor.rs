use {
    super::{idempotency::Acquire, pipeline::Pipeline},
    crate::{
        adapters::signature::VerifierRegistry,
        config::SupervisorConfig,
        domain::{
            alert::{Alert, AlertKind, AlertSeverity, AlertSink},
            clock::Clock,
            error::PipelineError,
            event::WebhookEvent,
            store::PaymentStore,
        },
    },
    chrono::{DateTime, Utc},
    std::sync::Arc,
    tokio::{
        sync::watch,
        time::{Instant, sleep},
    },
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub stale: usize,
    pub reclaimed: usize,
    pub resolved: usize,
    pub escalated: usize,
    pub errors: usize,
}

/// Reclaims events abandoned in `processing` and escalates the ones that
/// keep failing. Provider redelivery schedules only feed alerting here.
pub struct Supervisor {
    pipeline: Arc<Pipeline>,
    registry: Arc<VerifierRegistry>,
    store: Arc<dyn PaymentStore>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(
        pipeline: Arc<Pipeline>,
        registry: Arc<VerifierRegistry>,
        store: Arc<dyn PaymentStore>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            pipeline,
            registry,
            store,
            alerts,
            clock,
            config,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            "supervisor started"
        );
        let mut last_archive: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("supervisor shutting down");
                    return;
                }
                _ = sleep(self.config.sweep_interval) => {}
            }

            match self.sweep_once().await {
                Ok(report) if report.stale > 0 => tracing::info!(?report, "sweep finished"),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "sweep failed"),
            }

            if last_archive.is_none_or(|at| at.elapsed() >= self.config.archive_interval) {
                last_archive = Some(Instant::now());
                match self.archive_once().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(count = n, "archived completed events"),
                    Err(e) => tracing::error!(error = %e, "archive failed"),
                }
            }
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, PipelineError> {
        let now = self.clock.now();
        let timeout = self.pipeline.guard().config().processing_timeout;
        let claimed_before = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| now.checked_sub_signed(t))
            .ok_or_else(|| {
                PipelineError::Validation(format!("processing timeout out of range: {timeout:?}"))
            })?;
        let stale = self
            .store
            .stale_processing(claimed_before, self.config.batch_size)
            .await?;

        let mut report = SweepReport {
            stale: stale.len(),
            ..SweepReport::default()
        };
        for row in stale {
            if let Err(e) = self.recover(row, now, &mut report).await {
                report.errors += 1;
                tracing::warn!(error = %e, "recovery attempt failed");
            }
        }
        Ok(report)
    }

    #[tracing::instrument(
        name = "recover",
        skip_all,
        fields(provider = %row.key.provider, event_id = %row.key.event_id, attempt = row.attempt)
    )]
    async fn recover(
        &self,
        row: WebhookEvent,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), PipelineError> {
        self.warn_if_past_redelivery(&row, now).await;

        let lease = match self.pipeline.guard().resolve_existing(row.clone(), now).await? {
            Acquire::Lease(lease) => lease,
            Acquire::Escalated { .. } => {
                report.escalated += 1;
                return Ok(());
            }
            Acquire::AlreadyCompleted | Acquire::AlreadyProcessing => return Ok(()),
        };
        report.reclaimed += 1;

        let normalized = self
            .registry
            .normalize(row.key.provider, &row.raw_body, row.received_at);
        let event = match normalized {
            Ok(event) => event,
            Err(e) => {
                // Verified once, unreadable now: nothing will fix it automatically.
                tracing::error!(error = %e, "stored body no longer normalizes");
                let mut failed = row;
                failed.attempt = lease.attempt;
                failed.last_error = Some(format!("re-normalization failed: {e}"));
                self.pipeline.guard().escalate(&failed, now).await?;
                report.escalated += 1;
                return Ok(());
            }
        };

        let outcome = self.pipeline.run_lease(&lease, &event).await?;
        tracing::info!(outcome = outcome.as_str(), "recovered event");
        report.resolved += 1;
        Ok(())
    }

    /// Warns once, on the attempt during which the horizon was crossed.
    /// Providers that never redeliver are left to escalation.
    async fn warn_if_past_redelivery(&self, row: &WebhookEvent, now: DateTime<Utc>) {
        if !row.key.provider.redelivers() {
            return;
        }
        let horizon = row.key.provider.redelivery_horizon();
        let past_now = now - row.received_at > horizon;
        let past_at_claim = row.claimed_at - row.received_at > horizon;
        if !past_now || past_at_claim {
            return;
        }
        self.alerts
            .fire(Alert {
                kind: AlertKind::PastProviderRedelivery,
                severity: AlertSeverity::Warning,
                key: row.key.clone(),
                attempt: row.attempt,
                received_at: row.received_at,
                message: format!(
                    "{} is still processing after the provider stopped redelivering",
                    row.key
                ),
            })
            .await;
    }

    pub async fn archive_once(&self) -> Result<u64, PipelineError> {
        let retention = self.config.retention;
        let before = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| self.clock.now().checked_sub_signed(r))
            .ok_or_else(|| {
                PipelineError::Validation(format!("retention out of range: {retention:?}"))
            })?;
        self.store.archive_completed(before).await
    }
}
