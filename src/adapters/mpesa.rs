//! M-Pesa callbacks arrive unsigned from Safaricom, so they are received by a
//! relay that wraps each one in an envelope and signs it with Ed25519. This
//! adapter only accepts relayed envelopes.

use {
    super::signature::{self, SignatureVerifier},
    crate::domain::{
        error::VerificationError,
        event::{EventKind, NormalizedEvent},
        id::OrderId,
        money::{Currency, Money},
        provider::Provider,
    },
    axum::http::HeaderMap,
    base64::{Engine, engine::general_purpose::STANDARD},
    chrono::{DateTime, Utc},
    ed25519_dalek::{Signature, VerifyingKey},
    serde::Deserialize,
    serde_json::Value,
    std::time::Duration,
};

pub const SIGNATURE_HEADER: &str = "x-mpesa-signature";
pub const TIMESTAMP_HEADER: &str = "x-mpesa-timestamp";

const RESULT_OK: i64 = 0;
const RESULT_CANCELLED_BY_USER: i64 = 1032;

#[derive(Deserialize)]
struct RelayEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    order_id: Option<String>,
    occurred_at: Option<DateTime<Utc>>,
    callback: Value,
}

pub struct MpesaVerifier {
    key: VerifyingKey,
    tolerance: Duration,
}

impl MpesaVerifier {
    pub fn new(key: VerifyingKey, tolerance: Duration) -> Self {
        Self { key, tolerance }
    }

    pub fn from_base64_key(encoded: &str, tolerance: Duration) -> Result<Self, VerificationError> {
        let bytes: [u8; 32] = STANDARD
            .decode(encoded.trim())
            .map_err(|e| VerificationError::Malformed(format!("relay key: {e}")))?
            .try_into()
            .map_err(|_| VerificationError::Malformed("relay key must be 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| VerificationError::Malformed(format!("relay key: {e}")))?;
        Ok(Self::new(key, tolerance))
    }
}

/// `{Name, Value}` item from an STK callback's metadata list.
fn stk_item<'a>(stk: &'a Value, name: &str) -> Option<&'a Value> {
    signature::lookup(stk, "CallbackMetadata.Item")?
        .as_array()?
        .iter()
        .find(|item| item.get("Name").and_then(Value::as_str) == Some(name))?
        .get("Value")
}

/// `{Key, Value}` item from a reversal result's parameter list.
fn result_param<'a>(result: &'a Value, key: &str) -> Option<&'a Value> {
    signature::lookup(result, "ResultParameters.ResultParameter")?
        .as_array()?
        .iter()
        .find(|item| item.get("Key").and_then(Value::as_str) == Some(key))?
        .get("Value")
}

fn kes(amount: Option<&Value>) -> Result<Option<Money>, VerificationError> {
    signature::major_money(amount, Some(&Value::from(Currency::Kes.as_str())))
}

impl SignatureVerifier for MpesaVerifier {
    fn provider(&self) -> Provider {
        Provider::Mpesa
    }

    fn authenticate(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> Result<(), VerificationError> {
        let timestamp = signature::header(headers, TIMESTAMP_HEADER)?;
        let signed_at: i64 = timestamp
            .parse()
            .map_err(|_| VerificationError::InvalidSignature)?;
        let sig_bytes = STANDARD
            .decode(signature::header(headers, SIGNATURE_HEADER)?)
            .map_err(|_| VerificationError::InvalidSignature)?;
        let sig =
            Signature::from_slice(&sig_bytes).map_err(|_| VerificationError::InvalidSignature)?;

        let mut message = Vec::with_capacity(timestamp.len() + 1 + raw_body.len());
        message.extend_from_slice(timestamp.as_bytes());
        message.push(b'.');
        message.extend_from_slice(raw_body);

        self.key
            .verify_strict(&message, &sig)
            .map_err(|_| VerificationError::InvalidSignature)?;
        signature::check_replay_window(signed_at, now, self.tolerance)
    }

    fn normalize(
        &self,
        raw_body: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<NormalizedEvent, VerificationError> {
        let envelope: RelayEnvelope = serde_json::from_slice(raw_body)?;
        let order_id = envelope.order_id.and_then(|id| OrderId::new(id).ok());

        let (kind, money, reference) = match envelope.event_type.as_str() {
            "stk_callback" => {
                let stk = signature::lookup(&envelope.callback, "Body.stkCallback")
                    .ok_or_else(|| VerificationError::Malformed("missing stkCallback".into()))?;
                let kind = match stk.get("ResultCode").and_then(Value::as_i64) {
                    Some(RESULT_OK) => EventKind::Succeeded,
                    Some(RESULT_CANCELLED_BY_USER) => EventKind::Cancelled,
                    Some(_) => EventKind::Failed,
                    None => return Err(VerificationError::Malformed("missing ResultCode".into())),
                };
                let reference = stk_item(stk, "MpesaReceiptNumber")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .or_else(|| signature::text(stk, "CheckoutRequestID"));
                (kind, kes(stk_item(stk, "Amount"))?, reference)
            }
            "reversal" => {
                let result = envelope.callback.get("Result").unwrap_or(&envelope.callback);
                (
                    EventKind::Refunded,
                    kes(result_param(result, "Amount"))?,
                    signature::text(result, "TransactionID"),
                )
            }
            _ => (EventKind::Ignored, None, None),
        };

        Ok(NormalizedEvent {
            provider: Provider::Mpesa,
            provider_event_id: signature::event_id(envelope.id)?,
            kind: signature::effective_kind(kind, &order_id),
            order_id,
            money,
            reference,
            occurred_at: envelope.occurred_at.unwrap_or(received_at),
            event_type: envelope.event_type,
        })
    }
}
