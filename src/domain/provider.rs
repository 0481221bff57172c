use {
    super::error::PipelineError,
    chrono::Duration,
    serde::{Deserialize, Serialize},
    std::fmt,
};

/// The closed set of payment providers that deliver webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Stripe,
    Paystack,
    Flutterwave,
    Mpesa,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Stripe,
        Provider::Paystack,
        Provider::Flutterwave,
        Provider::Mpesa,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::Paystack => "paystack",
            Self::Flutterwave => "flutterwave",
            Self::Mpesa => "mpesa",
        }
    }

    /// Slot in per-provider lookup tables.
    pub fn index(&self) -> usize {
        match self {
            Self::Stripe => 0,
            Self::Paystack => 1,
            Self::Flutterwave => 2,
            Self::Mpesa => 3,
        }
    }

    /// Whether the provider redelivers on a non-2xx response.
    pub fn redelivers(&self) -> bool {
        !matches!(self, Self::Mpesa)
    }

    /// How long the provider keeps redelivering an unacknowledged event.
    /// Only used for alert thresholds.
    pub fn redelivery_horizon(&self) -> Duration {
        match self {
            Self::Stripe => Duration::days(3),
            Self::Paystack => Duration::hours(72),
            Self::Flutterwave => Duration::hours(72),
            Self::Mpesa => Duration::zero(),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Provider {
    type Error = PipelineError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "stripe" => Ok(Self::Stripe),
            "paystack" => Ok(Self::Paystack),
            "flutterwave" => Ok(Self::Flutterwave),
            "mpesa" => Ok(Self::Mpesa),
            other => Err(PipelineError::Validation(format!(
                "unknown provider: {other}"
            ))),
        }
    }
}
