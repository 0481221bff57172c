//! Provider-agnostic verification contract and the static provider table.
//!
//! Every adapter authenticates the raw, unparsed body first; only then is the
//! JSON parsed into a [`NormalizedEvent`].

use {
    crate::{
        adapters::{
            flutterwave::FlutterwaveVerifier, mpesa::MpesaVerifier, paystack::PaystackVerifier,
            stripe::StripeVerifier,
        },
        config::{ConfigError, ProviderSecrets},
        domain::{
            error::VerificationError,
            event::{EventKind, NormalizedEvent},
            id::{OrderId, ProviderEventId},
            money::{Currency, Money, MoneyAmount},
            provider::Provider,
        },
    },
    axum::http::HeaderMap,
    chrono::{DateTime, Utc},
    serde_json::Value,
    std::{sync::Arc, time::Duration},
};

pub trait SignatureVerifier: Send + Sync {
    fn provider(&self) -> Provider;

    /// Check the signature (and replay window, where the scheme has one).
    fn authenticate(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> Result<(), VerificationError>;

    /// Map an already-authenticated body. `received_at` stands in for
    /// payloads that carry no event time.
    fn normalize(
        &self,
        raw_body: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<NormalizedEvent, VerificationError>;

    fn verify(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> Result<NormalizedEvent, VerificationError> {
        self.authenticate(raw_body, headers, now)?;
        self.normalize(raw_body, now)
    }
}

/// One slot per [`Provider`], indexed by [`Provider::index`].
#[derive(Clone, Default)]
pub struct VerifierRegistry {
    table: [Option<Arc<dyn SignatureVerifier>>; 4],
}

impl VerifierRegistry {
    pub fn from_secrets(
        secrets: &ProviderSecrets,
        replay_window: Duration,
    ) -> Result<Self, ConfigError> {
        let mut registry = Self::default();
        if let Some(secret) = &secrets.stripe {
            registry.register(Arc::new(StripeVerifier::new(secret, replay_window)));
        }
        if let Some(secret) = &secrets.paystack {
            registry.register(Arc::new(PaystackVerifier::new(secret)));
        }
        if let Some(secret) = &secrets.flutterwave {
            registry.register(Arc::new(FlutterwaveVerifier::new(secret)));
        }
        if let Some(key) = &secrets.mpesa_public_key {
            let verifier = MpesaVerifier::from_base64_key(key, replay_window).map_err(|e| {
                ConfigError::Invalid {
                    key: "MPESA_RELAY_PUBLIC_KEY",
                    reason: e.to_string(),
                }
            })?;
            registry.register(Arc::new(verifier));
        }
        Ok(registry)
    }

    pub fn register(&mut self, verifier: Arc<dyn SignatureVerifier>) {
        let slot = verifier.provider().index();
        self.table[slot] = Some(verifier);
    }

    pub fn get(&self, provider: Provider) -> Result<&dyn SignatureVerifier, VerificationError> {
        self.table[provider.index()]
            .as_deref()
            .ok_or_else(|| VerificationError::ProviderNotConfigured(provider.to_string()))
    }

    pub fn verify(
        &self,
        provider: Provider,
        raw_body: &[u8],
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> Result<NormalizedEvent, VerificationError> {
        self.get(provider)?.verify(raw_body, headers, now)
    }

    pub fn normalize(
        &self,
        provider: Provider,
        raw_body: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<NormalizedEvent, VerificationError> {
        self.get(provider)?.normalize(raw_body, received_at)
    }
}

// ── Shared helpers for the adapters ────────────────────────────────────────

pub(crate) fn header<'a>(
    headers: &'a HeaderMap,
    name: &'static str,
) -> Result<&'a str, VerificationError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(VerificationError::MissingSignature(name))
}

pub(crate) fn check_replay_window(
    signed_at: i64,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<(), VerificationError> {
    let skew_secs = (now.timestamp() - signed_at).abs();
    if skew_secs > window.as_secs() as i64 {
        return Err(VerificationError::Expired { skew_secs });
    }
    Ok(())
}

/// Walk a dotted path through nested objects.
pub(crate) fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, segment| v.get(segment))
}

/// String or number field rendered as a string; empty strings are absent.
pub(crate) fn text(value: &Value, path: &str) -> Option<String> {
    match lookup(value, path)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn event_id(raw: String) -> Result<ProviderEventId, VerificationError> {
    ProviderEventId::new(raw).map_err(|e| VerificationError::Malformed(e.to_string()))
}

/// A verified event that names no order has nothing to act on.
pub(crate) fn effective_kind(kind: EventKind, order_id: &Option<OrderId>) -> EventKind {
    if order_id.is_some() { kind } else { EventKind::Ignored }
}

/// First path that yields a usable order id.
pub(crate) fn order_id(value: &Value, paths: &[&str]) -> Option<OrderId> {
    paths
        .iter()
        .filter_map(|p| text(value, p))
        .find_map(|s| OrderId::new(s).ok())
}

pub(crate) fn minor_money(
    amount: Option<&Value>,
    currency: Option<&Value>,
) -> Result<Option<Money>, VerificationError> {
    let (Some(amount), Some(currency)) = (amount, currency.and_then(Value::as_str)) else {
        return Ok(None);
    };
    let currency =
        Currency::try_from(currency).map_err(|e| VerificationError::Malformed(e.to_string()))?;
    let minor = amount
        .as_i64()
        .ok_or_else(|| VerificationError::Malformed(format!("non-integer amount: {amount}")))?;
    let amount = MoneyAmount::new(minor).map_err(|e| VerificationError::Malformed(e.to_string()))?;
    Ok(Some(Money::new(amount, currency)))
}

pub(crate) fn major_money(
    amount: Option<&Value>,
    currency: Option<&Value>,
) -> Result<Option<Money>, VerificationError> {
    let (Some(amount), Some(currency)) = (amount, currency.and_then(Value::as_str)) else {
        return Ok(None);
    };
    let currency =
        Currency::try_from(currency).map_err(|e| VerificationError::Malformed(e.to_string()))?;
    let raw = match amount {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => return Err(VerificationError::Malformed(format!("bad amount: {other}"))),
    };
    let amount = MoneyAmount::from_major(&raw, &currency)
        .map_err(|e| VerificationError::Malformed(e.to_string()))?;
    Ok(Some(Money::new(amount, currency)))
}

pub(crate) fn rfc3339(value: &Value, paths: &[&str]) -> Option<DateTime<Utc>> {
    paths
        .iter()
        .filter_map(|p| lookup(value, p).and_then(Value::as_str))
        .find_map(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
