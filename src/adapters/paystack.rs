use {
    super::signature::{self, SignatureVerifier},
    crate::domain::{
        error::VerificationError,
        event::{EventKind, NormalizedEvent},
        provider::Provider,
    },
    axum::http::HeaderMap,
    chrono::{DateTime, Utc},
    hmac::{Hmac, Mac},
    serde::Deserialize,
    serde_json::Value,
    sha2::Sha512,
};

pub const SIGNATURE_HEADER: &str = "x-paystack-signature";

#[derive(Deserialize)]
struct PaystackEvent {
    event: String,
    data: Value,
}

/// Hex HMAC-SHA512 of the raw body, keyed with the secret key.
/// Paystack sends no timestamp, so there is no replay window.
pub struct PaystackVerifier {
    secret: Vec<u8>,
}

impl PaystackVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }
}

fn kind(event: &str, data: &Value) -> EventKind {
    match event {
        "charge.success" => EventKind::Succeeded,
        "charge.failed" | "invoice.payment_failed" => EventKind::Failed,
        "refund.processed" => EventKind::Refunded,
        "charge.dispute.create" => EventKind::DisputeOpened,
        // "declined" means the merchant's evidence was accepted.
        "charge.dispute.resolve" => match data.get("resolution").and_then(Value::as_str) {
            Some("declined") => EventKind::DisputeWon,
            _ => EventKind::DisputeLost,
        },
        "invoice.update" if invoice_paid(data) => EventKind::SubscriptionRenewed,
        "subscription.disable" => EventKind::SubscriptionCancelled,
        _ => EventKind::Ignored,
    }
}

fn invoice_paid(data: &Value) -> bool {
    data.get("status").and_then(Value::as_str) == Some("success")
        || data.get("paid").and_then(Value::as_bool) == Some(true)
}

impl SignatureVerifier for PaystackVerifier {
    fn provider(&self) -> Provider {
        Provider::Paystack
    }

    fn authenticate(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
        _now: DateTime<Utc>,
    ) -> Result<(), VerificationError> {
        let expected = hex::decode(signature::header(headers, SIGNATURE_HEADER)?)
            .map_err(|_| VerificationError::InvalidSignature)?;
        let mut mac = Hmac::<Sha512>::new_from_slice(&self.secret)
            .map_err(|_| VerificationError::InvalidSignature)?;
        mac.update(raw_body);
        mac.verify_slice(&expected)
            .map_err(|_| VerificationError::InvalidSignature)
    }

    fn normalize(
        &self,
        raw_body: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<NormalizedEvent, VerificationError> {
        let PaystackEvent { event, data } = serde_json::from_slice(raw_body)?;

        // Paystack has no envelope id; the object id is unique per event type.
        let object_id = signature::text(&data, "id")
            .or_else(|| signature::text(&data, "reference"))
            .ok_or_else(|| VerificationError::Malformed("data.id missing".into()))?;

        let reference = signature::text(&data, "reference")
            .or_else(|| signature::text(&data, "transaction_reference"));

        let order_id = signature::order_id(
            &data,
            &[
                "metadata.order_id",
                "transaction.metadata.order_id",
                "reference",
                "transaction_reference",
            ],
        );

        Ok(NormalizedEvent {
            provider: Provider::Paystack,
            provider_event_id: signature::event_id(format!("{event}:{object_id}"))?,
            kind: signature::effective_kind(kind(&event, &data), &order_id),
            order_id,
            money: signature::minor_money(data.get("amount"), data.get("currency"))?,
            reference,
            occurred_at: signature::rfc3339(
                &data,
                &["paid_at", "paidAt", "created_at", "createdAt"],
            )
            .unwrap_or(received_at),
            event_type: event,
        })
    }
}
