use {
    super::error::PipelineError,
    super::id::OrderId,
    super::money::MoneyAmount,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    std::fmt,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    AwaitingPayment,
    Processing,
    Completed,
    PaymentFailed,
    Cancelled,
    Refunded,
    Disputed,
}

impl PaymentStatus {
    pub const ALL: [PaymentStatus; 8] = [
        PaymentStatus::Pending,
        PaymentStatus::AwaitingPayment,
        PaymentStatus::Processing,
        PaymentStatus::Completed,
        PaymentStatus::PaymentFailed,
        PaymentStatus::Cancelled,
        PaymentStatus::Refunded,
        PaymentStatus::Disputed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AwaitingPayment => "awaiting_payment",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::PaymentFailed => "payment_failed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
            Self::Disputed => "disputed",
        }
    }

    /// No further automated transitions leave a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Refunded)
    }

    /// Edges of the order-payment transition graph.
    pub fn can_transition_to(&self, next: &PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, AwaitingPayment)
                | (AwaitingPayment, Processing)
                | (AwaitingPayment, PaymentFailed)
                | (AwaitingPayment, Cancelled)
                | (Processing, Completed)
                | (Processing, PaymentFailed)
                | (PaymentFailed, Pending)
                | (Completed, Refunded)
                | (Completed, Disputed)
                | (Disputed, Completed)
                | (Disputed, Refunded)
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for PaymentStatus {
    type Error = PipelineError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "pending" => Ok(Self::Pending),
            "awaiting_payment" => Ok(Self::AwaitingPayment),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "payment_failed" => Ok(Self::PaymentFailed),
            "cancelled" => Ok(Self::Cancelled),
            "refunded" => Ok(Self::Refunded),
            "disputed" => Ok(Self::Disputed),
            other => Err(PipelineError::Validation(format!(
                "unknown payment status: {other}"
            ))),
        }
    }
}

/// The payment slice of an order record. Only the effect dispatcher writes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderPaymentState {
    pub order_id: OrderId,
    pub status: PaymentStatus,
    pub payment_intent_ref: Option<String>,
    pub refunded_amount: MoneyAmount,
    pub dispute_ref: Option<String>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl OrderPaymentState {
    /// A freshly placed order, as the order domain creates it.
    pub fn new(order_id: OrderId, status: PaymentStatus, now: DateTime<Utc>) -> Self {
        Self {
            order_id,
            status,
            payment_intent_ref: None,
            refunded_amount: MoneyAmount::ZERO,
            dispute_ref: None,
            version: 0,
            updated_at: now,
        }
    }
}

/// Field changes folded from a transition's effects, applied as one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderPatch {
    pub status: PaymentStatus,
    pub payment_intent_ref: Option<String>,
    pub refund_delta: MoneyAmount,
    pub dispute_ref: Option<String>,
}

impl OrderPatch {
    pub fn status_only(status: PaymentStatus) -> Self {
        Self {
            status,
            payment_intent_ref: None,
            refund_delta: MoneyAmount::ZERO,
            dispute_ref: None,
        }
    }

    /// Apply onto a current state, bumping `version`.
    pub fn apply_to(
        &self,
        current: &OrderPaymentState,
        now: DateTime<Utc>,
    ) -> Result<OrderPaymentState, PipelineError> {
        let refunded_amount = current
            .refunded_amount
            .checked_add(self.refund_delta)
            .ok_or_else(|| PipelineError::Validation("refunded amount overflow".into()))?;

        Ok(OrderPaymentState {
            order_id: current.order_id.clone(),
            status: self.status,
            payment_intent_ref: self
                .payment_intent_ref
                .clone()
                .or_else(|| current.payment_intent_ref.clone()),
            refunded_amount,
            dispute_ref: self.dispute_ref.clone().or_else(|| current.dispute_ref.clone()),
            version: current.version + 1,
            updated_at: now,
        })
    }
}
