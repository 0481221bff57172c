use {
    super::error::PipelineError,
    super::id::{OrderId, ProviderEventId},
    super::money::Money,
    super::provider::Provider,
    chrono::{DateTime, Utc},
    derive_more::Display,
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    std::fmt,
};

/// Idempotency key: `(provider, providerEventId)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[display("{provider}:{event_id}")]
pub struct EventKey {
    pub provider: Provider,
    pub event_id: ProviderEventId,
}

impl EventKey {
    pub fn new(provider: Provider, event_id: ProviderEventId) -> Self {
        Self { provider, event_id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Processing,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for EventStatus {
    type Error = PipelineError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(PipelineError::Validation(format!(
                "unknown event status: {other}"
            ))),
        }
    }
}

/// How a completed event was resolved. Recorded for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Applied,
    Noop,
    Illegal,
    Ignored,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Noop => "noop",
            Self::Illegal => "illegal",
            Self::Ignored => "ignored",
        }
    }
}

impl TryFrom<&str> for EventOutcome {
    type Error = PipelineError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "applied" => Ok(Self::Applied),
            "noop" => Ok(Self::Noop),
            "illegal" => Ok(Self::Illegal),
            "ignored" => Ok(Self::Ignored),
            other => Err(PipelineError::Validation(format!(
                "unknown event outcome: {other}"
            ))),
        }
    }
}

/// One row per inbound delivery that reached the processing stage.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub key: EventKey,
    pub event_type: String,
    pub status: EventStatus,
    pub outcome: Option<EventOutcome>,
    pub attempt: i32,
    pub payload_digest: String,
    /// Verified body; only read back to re-normalize an abandoned event.
    pub raw_body: Vec<u8>,
    pub received_at: DateTime<Utc>,
    /// Start of the current lease.
    pub claimed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// For INSERT by the idempotency guard.
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub key: EventKey,
    pub event_type: String,
    pub payload_digest: String,
    pub raw_body: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl NewWebhookEvent {
    pub fn from_normalized(event: &NormalizedEvent, raw_body: &[u8], now: DateTime<Utc>) -> Self {
        Self {
            key: event.key(),
            event_type: event.event_type.clone(),
            payload_digest: event.digest(),
            raw_body: raw_body.to_vec(),
            received_at: now,
        }
    }
}

/// Provider-agnostic meaning of an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    IntentCreated,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
    RetryRequested,
    Refunded,
    DisputeOpened,
    DisputeWon,
    DisputeLost,
    SubscriptionRenewed,
    SubscriptionCancelled,
    Ignored,
}

impl EventKind {
    pub const ALL: [EventKind; 13] = [
        EventKind::IntentCreated,
        EventKind::Processing,
        EventKind::Succeeded,
        EventKind::Failed,
        EventKind::Cancelled,
        EventKind::RetryRequested,
        EventKind::Refunded,
        EventKind::DisputeOpened,
        EventKind::DisputeWon,
        EventKind::DisputeLost,
        EventKind::SubscriptionRenewed,
        EventKind::SubscriptionCancelled,
        EventKind::Ignored,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IntentCreated => "intent_created",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::RetryRequested => "retry_requested",
            Self::Refunded => "refunded",
            Self::DisputeOpened => "dispute_opened",
            Self::DisputeWon => "dispute_won",
            Self::DisputeLost => "dispute_lost",
            Self::SubscriptionRenewed => "subscription_renewed",
            Self::SubscriptionCancelled => "subscription_cancelled",
            Self::Ignored => "ignored",
        }
    }

    /// Kinds allowed to move an order out of `disputed`.
    pub fn resolves_dispute(&self) -> bool {
        matches!(self, Self::DisputeWon | Self::DisputeLost | Self::Refunded)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output of a provider adapter and the sole input to the state machine.
/// Never persisted verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedEvent {
    pub provider: Provider,
    pub provider_event_id: ProviderEventId,
    /// Raw provider type string, e.g. `payment_intent.succeeded`.
    pub event_type: String,
    pub order_id: Option<OrderId>,
    pub kind: EventKind,
    pub money: Option<Money>,
    /// Intent, charge or dispute reference, depending on `kind`.
    pub reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl NormalizedEvent {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.provider, self.provider_event_id.clone())
    }

    /// Events with nothing to act on are acknowledged without touching state.
    pub fn is_actionable(&self) -> bool {
        self.kind != EventKind::Ignored && self.order_id.is_some()
    }

    /// Hex SHA-256 of the normalized form, for audit and debugging.
    pub fn digest(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }
}
