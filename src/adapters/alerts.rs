use {
    crate::domain::alert::{Alert, AlertSeverity, AlertSink},
    std::{future::Future, pin::Pin},
};

/// Default sink: operators pick alerts up from the error/warn log stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn fire(&self, alert: Alert) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match alert.severity {
                AlertSeverity::Critical => tracing::error!(
                    alert = ?alert.kind,
                    provider = %alert.key.provider,
                    event_id = %alert.key.event_id,
                    attempt = alert.attempt,
                    received_at = %alert.received_at,
                    "{}", alert.message
                ),
                AlertSeverity::Warning => tracing::warn!(
                    alert = ?alert.kind,
                    provider = %alert.key.provider,
                    event_id = %alert.key.event_id,
                    attempt = alert.attempt,
                    received_at = %alert.received_at,
                    "{}", alert.message
                ),
            }
        })
    }
}
