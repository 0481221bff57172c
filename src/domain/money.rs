use {
    super::error::PipelineError,
    rust_decimal::{Decimal, prelude::ToPrimitive},
    serde::{Deserialize, Serialize},
    std::{fmt, str::FromStr},
};

/// Amount in minor units (cents, kobo, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MoneyAmount(i64);

impl MoneyAmount {
    pub const ZERO: MoneyAmount = MoneyAmount(0);

    pub fn new(minor: i64) -> Result<Self, PipelineError> {
        if minor < 0 {
            return Err(PipelineError::Validation(format!(
                "MoneyAmount cannot be negative, got: {minor}"
            )));
        }
        Ok(Self(minor))
    }

    /// Parse a major-unit decimal (`"100.5"`) into minor units, exactly.
    pub fn from_major(major: &str, currency: &Currency) -> Result<Self, PipelineError> {
        let value = Decimal::from_str(major.trim())
            .map_err(|e| PipelineError::Validation(format!("invalid amount {major}: {e}")))?;
        let scaled = value * Decimal::from(10_i64.pow(currency.exponent()));
        if scaled.fract() != Decimal::ZERO {
            return Err(PipelineError::Validation(format!(
                "amount {major} has more precision than {currency} allows"
            )));
        }
        let minor = scaled
            .to_i64()
            .ok_or_else(|| PipelineError::Validation(format!("amount out of range: {major}")))?;
        Self::new(minor)
    }

    pub fn minor(&self) -> i64 {
        self.0
    }

    pub fn checked_add(self, other: MoneyAmount) -> Option<MoneyAmount> {
        self.0.checked_add(other.0).map(MoneyAmount)
    }
}

impl fmt::Display for MoneyAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
    Jpy,
    Ngn,
    Ghs,
    Kes,
    Zar,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usd => "usd",
            Self::Eur => "eur",
            Self::Gbp => "gbp",
            Self::Jpy => "jpy",
            Self::Ngn => "ngn",
            Self::Ghs => "ghs",
            Self::Kes => "kes",
            Self::Zar => "zar",
        }
    }

    /// Number of minor-unit digits.
    pub fn exponent(&self) -> u32 {
        match self {
            Self::Jpy => 0,
            _ => 2,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Currency {
    type Error = PipelineError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_ascii_lowercase().as_str() {
            "usd" => Ok(Self::Usd),
            "eur" => Ok(Self::Eur),
            "gbp" => Ok(Self::Gbp),
            "jpy" => Ok(Self::Jpy),
            "ngn" => Ok(Self::Ngn),
            "ghs" => Ok(Self::Ghs),
            "kes" => Ok(Self::Kes),
            "zar" => Ok(Self::Zar),
            other => Err(PipelineError::Validation(format!(
                "unknown currency: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    amount: MoneyAmount,
    currency: Currency,
}

impl Money {
    pub fn new(amount: MoneyAmount, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub fn amount(&self) -> MoneyAmount {
        self.amount
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_major_is_exact() {
        let amount = MoneyAmount::from_major("100.50", &Currency::Ngn).unwrap();
        assert_eq!(amount.minor(), 10050);

        let yen = MoneyAmount::from_major("1200", &Currency::Jpy).unwrap();
        assert_eq!(yen.minor(), 1200);
    }

    #[test]
    fn from_major_rejects_sub_minor_precision() {
        assert!(MoneyAmount::from_major("1.005", &Currency::Usd).is_err());
        assert!(MoneyAmount::from_major("-1", &Currency::Usd).is_err());
    }

    #[test]
    fn currency_parse_is_case_insensitive() {
        assert_eq!(Currency::try_from("KES").unwrap(), Currency::Kes);
        assert!(Currency::try_from("xyz").is_err());
    }
}
