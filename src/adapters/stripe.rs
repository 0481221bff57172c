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
    sha2::Sha256,
    std::time::Duration,
};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: StripeEventData,
}

#[derive(Deserialize)]
struct StripeEventData {
    object: Value,
}

/// `Stripe-Signature: t=<unix>,v1=<hex hmac-sha256 of "{t}.{body}">`.
pub struct StripeVerifier {
    secret: Vec<u8>,
    tolerance: Duration,
}

impl StripeVerifier {
    pub fn new(secret: &str, tolerance: Duration) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            tolerance,
        }
    }
}

struct ParsedHeader<'a> {
    timestamp: i64,
    signatures: Vec<&'a str>,
}

fn parse_header(value: &str) -> Result<ParsedHeader<'_>, VerificationError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in value.split(',') {
        match part.trim().split_once('=') {
            Some(("t", t)) => timestamp = t.parse::<i64>().ok(),
            Some(("v1", sig)) => signatures.push(sig),
            _ => {}
        }
    }
    match timestamp {
        Some(timestamp) if !signatures.is_empty() => Ok(ParsedHeader {
            timestamp,
            signatures,
        }),
        _ => Err(VerificationError::InvalidSignature),
    }
}

fn kind(event_type: &str, object: &Value) -> EventKind {
    match event_type {
        "payment_intent.created" => EventKind::IntentCreated,
        "payment_intent.processing" => EventKind::Processing,
        "payment_intent.succeeded" => EventKind::Succeeded,
        "payment_intent.payment_failed" => EventKind::Failed,
        "payment_intent.canceled" => EventKind::Cancelled,
        "payment_intent.requires_action" => EventKind::RetryRequested,
        "charge.refunded" => EventKind::Refunded,
        "charge.dispute.created" => EventKind::DisputeOpened,
        "charge.dispute.closed" => match object.get("status").and_then(Value::as_str) {
            Some("won") => EventKind::DisputeWon,
            Some("lost") => EventKind::DisputeLost,
            _ => EventKind::Ignored,
        },
        "invoice.paid" => EventKind::SubscriptionRenewed,
        "customer.subscription.deleted" => EventKind::SubscriptionCancelled,
        _ => EventKind::Ignored,
    }
}

impl SignatureVerifier for StripeVerifier {
    fn provider(&self) -> Provider {
        Provider::Stripe
    }

    fn authenticate(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> Result<(), VerificationError> {
        let header = parse_header(signature::header(headers, SIGNATURE_HEADER)?)?;

        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .map_err(|_| VerificationError::InvalidSignature)?;
        mac.update(header.timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(raw_body);

        // Several v1 entries appear while a secret is being rolled.
        let matched = header.signatures.iter().any(|sig| {
            hex::decode(sig).is_ok_and(|expected| mac.clone().verify_slice(&expected).is_ok())
        });
        if !matched {
            return Err(VerificationError::InvalidSignature);
        }
        signature::check_replay_window(header.timestamp, now, self.tolerance)
    }

    fn normalize(
        &self,
        raw_body: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<NormalizedEvent, VerificationError> {
        let event: StripeEvent = serde_json::from_slice(raw_body)?;
        if !event.id.starts_with("evt_") {
            return Err(VerificationError::Malformed(format!("unexpected event id {}", event.id)));
        }
        let object = &event.data.object;
        let order_id = signature::order_id(
            object,
            &[
                "metadata.order_id",
                "subscription_details.metadata.order_id",
                "parent.subscription_details.metadata.order_id",
            ],
        );
        let kind = signature::effective_kind(kind(&event.event_type, object), &order_id);

        let amount_field = match kind {
            EventKind::Refunded => "amount_refunded",
            EventKind::SubscriptionRenewed => "amount_paid",
            _ => "amount",
        };
        let reference = match kind {
            EventKind::Refunded => signature::text(object, "payment_intent"),
            EventKind::SubscriptionRenewed => signature::text(object, "payment_intent")
                .or_else(|| signature::text(object, "id")),
            _ => signature::text(object, "id"),
        };

        Ok(NormalizedEvent {
            provider: Provider::Stripe,
            provider_event_id: signature::event_id(event.id)?,
            order_id,
            kind,
            money: signature::minor_money(object.get(amount_field), object.get("currency"))?,
            reference,
            occurred_at: DateTime::from_timestamp(event.created, 0).unwrap_or(received_at),
            event_type: event.event_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    const SECRET: &str = "whsec_test";

    fn sign(body: &[u8], t: i64, secret: &str) -> HeaderMap {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{t}.").as_bytes());
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&format!("t={t},v1={sig}")).unwrap(),
        );
        headers
    }

    fn body(event_type: &str, object: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": event_type,
            "created": 1_700_000_000,
            "data": {"object": object},
        }))
        .unwrap()
    }

    fn verifier() -> StripeVerifier {
        StripeVerifier::new(SECRET, Duration::from_secs(300))
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_100, 0).unwrap()
    }

    #[test]
    fn verifies_and_normalizes_succeeded_intent() {
        let raw = body(
            "payment_intent.succeeded",
            json!({
                "id": "pi_1",
                "amount": 4200,
                "currency": "usd",
                "metadata": {"order_id": "ord_9"},
            }),
        );
        let headers = sign(&raw, now().timestamp(), SECRET);

        let event = verifier().verify(&raw, &headers, now()).unwrap();
        assert_eq!(event.kind, EventKind::Succeeded);
        assert_eq!(event.order_id.unwrap().as_str(), "ord_9");
        assert_eq!(event.money.unwrap().amount().minor(), 4200);
        assert_eq!(event.reference.as_deref(), Some("pi_1"));
        assert_eq!(event.provider_event_id.as_str(), "evt_1");
    }

    #[test]
    fn rejects_wrong_secret() {
        let raw = body("payment_intent.succeeded", json!({"id": "pi_1"}));
        let headers = sign(&raw, now().timestamp(), "whsec_other");
        assert!(matches!(
            verifier().authenticate(&raw, &headers, now()),
            Err(VerificationError::InvalidSignature)
        ));
    }

    #[test]
    fn rejects_tampered_body() {
        let raw = body("payment_intent.succeeded", json!({"id": "pi_1", "amount": 1}));
        let headers = sign(&raw, now().timestamp(), SECRET);
        let tampered = body("payment_intent.succeeded", json!({"id": "pi_1", "amount": 9}));
        assert!(verifier().authenticate(&tampered, &headers, now()).is_err());
    }

    #[test]
    fn rejects_stale_timestamp() {
        let raw = body("payment_intent.succeeded", json!({"id": "pi_1"}));
        let headers = sign(&raw, now().timestamp() - 301, SECRET);
        assert!(matches!(
            verifier().authenticate(&raw, &headers, now()),
            Err(VerificationError::Expired { .. })
        ));
    }

    #[test]
    fn missing_header_is_reported() {
        let raw = body("payment_intent.succeeded", json!({}));
        assert!(matches!(
            verifier().authenticate(&raw, &HeaderMap::new(), now()),
            Err(VerificationError::MissingSignature(SIGNATURE_HEADER))
        ));
    }

    #[test]
    fn dispute_closed_maps_on_status() {
        let dispute = |status: &str| {
            body(
                "charge.dispute.closed",
                json!({"id": "dp_1", "status": status, "metadata": {"order_id": "o"}}),
            )
        };
        let won = dispute("won");
        let lost = dispute("lost");
        let v = verifier();
        assert_eq!(v.normalize(&won, now()).unwrap().kind, EventKind::DisputeWon);
        assert_eq!(v.normalize(&lost, now()).unwrap().kind, EventKind::DisputeLost);
    }

    #[test]
    fn refund_uses_refunded_amount_and_intent_reference() {
        let raw = body(
            "charge.refunded",
            json!({
                "id": "ch_1", "payment_intent": "pi_1", "amount": 5000,
                "amount_refunded": 1200, "currency": "eur",
                "metadata": {"order_id": "ord_2"}
            }),
        );
        let event = verifier().normalize(&raw, now()).unwrap();
        assert_eq!(event.kind, EventKind::Refunded);
        assert_eq!(event.money.unwrap().amount().minor(), 1200);
        assert_eq!(event.reference.as_deref(), Some("pi_1"));
    }

    #[test]
    fn orderless_event_is_ignored() {
        let raw = body(
            "payment_intent.succeeded",
            json!({"id": "pi_1", "amount": 10, "currency": "usd"}),
        );
        let event = verifier().normalize(&raw, now()).unwrap();
        assert_eq!(event.kind, EventKind::Ignored);
        assert!(event.order_id.is_none());
    }

    #[test]
    fn unknown_types_are_ignored() {
        let raw = body("customer.created", json!({"id": "cus_1"}));
        let event = verifier().normalize(&raw, now()).unwrap();
        assert_eq!(event.kind, EventKind::Ignored);
        assert!(!event.is_actionable());
    }
}
