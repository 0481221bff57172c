use {
    crate::domain::provider::Provider,
    std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicU64, Ordering},
        },
        time::Duration,
    },
};

/// Emits through the `metrics` facade and keeps in-process tallies so tests
/// can assert on what was recorded without installing a recorder.
#[derive(Default)]
pub struct Telemetry {
    processed: Mutex<HashMap<(Provider, &'static str), u64>>,
    illegal: AtomicU64,
    exhausted: AtomicU64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_processed(&self, provider: Provider, status: &'static str, latency: Duration) {
        metrics::counter!(
            "webhook_processed_total",
            "provider" => provider.as_str(),
            "status" => status
        )
        .increment(1);
        metrics::histogram!(
            "webhook_processing_latency_seconds",
            "provider" => provider.as_str()
        )
        .record(latency.as_secs_f64());

        if let Ok(mut processed) = self.processed.lock() {
            *processed.entry((provider, status)).or_default() += 1;
        }
    }

    pub fn record_illegal(&self, provider: Provider) {
        metrics::counter!("state_transition_illegal_total", "provider" => provider.as_str())
            .increment(1);
        self.illegal.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exhausted(&self, provider: Provider) {
        metrics::counter!("webhook_exhausted_total", "provider" => provider.as_str()).increment(1);
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self, provider: Provider, status: &str) -> u64 {
        self.processed
            .lock()
            .map(|p| {
                p.iter()
                    .filter(|((pr, st), _)| *pr == provider && *st == status)
                    .map(|(_, n)| *n)
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn illegal(&self) -> u64 {
        self.illegal.load(Ordering::Relaxed)
    }

    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }
}
