use {
    super::event::EventKey,
    chrono::{DateTime, Utc},
    std::{future::Future, pin::Pin},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// Reclaim budget spent; the event is `failed` and needs a human.
    RetriesExhausted,
    /// Still unresolved after the provider stopped redelivering.
    PastProviderRedelivery,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub key: EventKey,
    pub attempt: i32,
    pub received_at: DateTime<Utc>,
    pub message: String,
}

pub trait AlertSink: Send + Sync {
    fn fire(&self, alert: Alert) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}
