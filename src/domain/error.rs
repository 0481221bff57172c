use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage unavailable: {0}")]
    Storage(String),

    #[error("cache: {0}")]
    Cache(String),

    /// Optimistic concurrency retries ran out; the event stays `processing`.
    #[error("version contention on order {order_id} after {attempts} attempts")]
    Contention { order_id: String, attempts: u32 },

    #[error("no payment record for order {0}")]
    OrderNotFound(String),
}

/// Rejection raised before an inbound payload reaches idempotency or state logic.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("missing signature header: {0}")]
    MissingSignature(&'static str),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("timestamp outside replay window ({skew_secs}s skew)")]
    Expired { skew_secs: i64 },

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl VerificationError {
    /// Short label used for log fields and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ProviderNotConfigured(_) => "not_configured",
            Self::MissingSignature(_) => "missing_signature",
            Self::InvalidSignature => "invalid_signature",
            Self::Expired { .. } => "expired",
            Self::Malformed(_) => "malformed",
        }
    }
}

impl From<serde_json::Error> for VerificationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}
