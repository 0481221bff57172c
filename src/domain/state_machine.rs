//! Pure transition function over the order-payment graph.
//!
//! `transition` maps the current [`PaymentStatus`] and a [`NormalizedEvent`]
//! to the next status plus a list of [`Effect`]s. Effects are data; the
//! effect dispatcher executes them. No I/O happens here.

use {
    super::error::PipelineError,
    super::event::{EventKind, NormalizedEvent},
    super::id::OrderId,
    super::money::MoneyAmount,
    super::payment::{OrderPatch, PaymentStatus},
    serde::Serialize,
    thiserror::Error,
};

pub const ORDER_FULFILLED: &str = "order.fulfilled";
pub const ORDER_REFUNDED: &str = "order.refunded";
pub const ORDER_DISPUTED: &str = "order.disputed";
pub const ORDER_DISPUTE_RESOLVED: &str = "order.dispute_resolved";
pub const INVENTORY_RESTOCK: &str = "inventory.restock";
pub const SUBSCRIPTION_RENEWED: &str = "subscription.renewed";
pub const USER_NOTIFY: &str = "user.notify";

/// Outbound contract: `{name, orderId, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub name: String,
    pub order_id: OrderId,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    PersistState(PaymentStatus),
    SetIntentRef(String),
    AddRefund(MoneyAmount),
    SetDisputeRef(String),
    EmitDomainEvent(DomainEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: PaymentStatus,
    pub next: PaymentStatus,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn noop(current: PaymentStatus) -> Self {
        Self {
            from: current,
            next: current,
            effects: Vec::new(),
        }
    }

    /// Re-application of an event whose target state is already reached.
    pub fn is_noop(&self) -> bool {
        self.effects.is_empty()
    }

    /// Fold state and field effects into one write.
    pub fn patch(&self) -> Result<OrderPatch, PipelineError> {
        let mut patch = OrderPatch::status_only(self.next);
        for effect in &self.effects {
            match effect {
                Effect::PersistState(status) => patch.status = *status,
                Effect::SetIntentRef(r) => patch.payment_intent_ref = Some(r.clone()),
                Effect::AddRefund(amount) => {
                    patch.refund_delta = patch
                        .refund_delta
                        .checked_add(*amount)
                        .ok_or_else(|| PipelineError::Validation("refund delta overflow".into()))?;
                }
                Effect::SetDisputeRef(r) => patch.dispute_ref = Some(r.clone()),
                Effect::EmitDomainEvent(_) => {}
            }
        }
        Ok(patch)
    }

    pub fn domain_events(&self) -> impl Iterator<Item = &DomainEvent> {
        self.effects.iter().filter_map(|e| match e {
            Effect::EmitDomainEvent(ev) => Some(ev),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition: {kind} event in {from} state")]
pub struct IllegalTransition {
    pub from: PaymentStatus,
    pub kind: EventKind,
}

/// Status an event kind drives the order towards.
fn target(kind: EventKind) -> Option<PaymentStatus> {
    use PaymentStatus::*;
    match kind {
        EventKind::IntentCreated => Some(AwaitingPayment),
        EventKind::Processing => Some(Processing),
        EventKind::Succeeded | EventKind::SubscriptionRenewed => Some(Completed),
        EventKind::Failed => Some(PaymentFailed),
        EventKind::Cancelled | EventKind::SubscriptionCancelled => Some(Cancelled),
        EventKind::RetryRequested => Some(Pending),
        EventKind::Refunded | EventKind::DisputeLost => Some(Refunded),
        EventKind::DisputeOpened => Some(Disputed),
        EventKind::DisputeWon => Some(Completed),
        EventKind::Ignored => None,
    }
}

/// Intermediate hop for the two edges that may be observed collapsed:
/// a success seen before `processing`, and a new intent after a failure.
fn via(from: PaymentStatus, to: PaymentStatus) -> Option<PaymentStatus> {
    use PaymentStatus::*;
    match (from, to) {
        (AwaitingPayment, Completed) => Some(Processing),
        (PaymentFailed, AwaitingPayment) => Some(Pending),
        _ => None,
    }
}

fn is_reachable(from: PaymentStatus, to: PaymentStatus) -> bool {
    if from.can_transition_to(&to) {
        return true;
    }
    via(from, to).is_some_and(|mid| from.can_transition_to(&mid) && mid.can_transition_to(&to))
}

pub fn transition(
    current: PaymentStatus,
    event: &NormalizedEvent,
) -> Result<Transition, IllegalTransition> {
    let illegal = IllegalTransition {
        from: current,
        kind: event.kind,
    };

    let Some(next) = target(event.kind) else {
        return Ok(Transition::noop(current));
    };
    if next == current {
        return Ok(Transition::noop(current));
    }
    // DisputeWon only resolves an open dispute.
    if event.kind == EventKind::DisputeWon && current != PaymentStatus::Disputed {
        return Err(illegal);
    }
    // An open dispute is left only by its resolution or a refund.
    if current == PaymentStatus::Disputed && !event.kind.resolves_dispute() {
        return Err(illegal);
    }
    if !is_reachable(current, next) {
        return Err(illegal);
    }

    let Some(order_id) = event.order_id.clone() else {
        return Ok(Transition::noop(current));
    };

    let mut effects = vec![Effect::PersistState(next)];
    effects.extend(field_effects(event));
    effects.extend(domain_event_names(event.kind, current).iter().map(|name| {
        Effect::EmitDomainEvent(domain_event(name, &order_id, current, next, event))
    }));

    Ok(Transition {
        from: current,
        next,
        effects,
    })
}

fn field_effects(event: &NormalizedEvent) -> Vec<Effect> {
    let reference = event.reference.clone();
    match event.kind {
        EventKind::IntentCreated
        | EventKind::Processing
        | EventKind::Succeeded
        | EventKind::SubscriptionRenewed => {
            reference.map(Effect::SetIntentRef).into_iter().collect()
        }
        EventKind::Refunded | EventKind::DisputeLost => event
            .money
            .map(|m| Effect::AddRefund(m.amount()))
            .into_iter()
            .collect(),
        EventKind::DisputeOpened => reference.map(Effect::SetDisputeRef).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn domain_event_names(kind: EventKind, from: PaymentStatus) -> &'static [&'static str] {
    match kind {
        EventKind::Succeeded => &[ORDER_FULFILLED, USER_NOTIFY],
        EventKind::SubscriptionRenewed => &[ORDER_FULFILLED, SUBSCRIPTION_RENEWED, USER_NOTIFY],
        EventKind::Failed => &[USER_NOTIFY],
        EventKind::Cancelled | EventKind::SubscriptionCancelled => {
            &[INVENTORY_RESTOCK, USER_NOTIFY]
        }
        EventKind::Refunded if from == PaymentStatus::Disputed => {
            &[ORDER_DISPUTE_RESOLVED, ORDER_REFUNDED, USER_NOTIFY]
        }
        EventKind::Refunded => &[ORDER_REFUNDED, USER_NOTIFY],
        EventKind::DisputeOpened => &[ORDER_DISPUTED],
        EventKind::DisputeWon => &[ORDER_DISPUTE_RESOLVED],
        EventKind::DisputeLost => &[ORDER_DISPUTE_RESOLVED, ORDER_REFUNDED, USER_NOTIFY],
        EventKind::IntentCreated
        | EventKind::Processing
        | EventKind::RetryRequested
        | EventKind::Ignored => &[],
    }
}

fn domain_event(
    name: &str,
    order_id: &OrderId,
    from: PaymentStatus,
    to: PaymentStatus,
    event: &NormalizedEvent,
) -> DomainEvent {
    let mut payload = serde_json::json!({
        "provider": event.provider.as_str(),
        "provider_event_id": event.provider_event_id.as_str(),
        "kind": event.kind.as_str(),
        "from": from.as_str(),
        "to": to.as_str(),
        "occurred_at": event.occurred_at.to_rfc3339(),
    });
    if let Some(money) = &event.money {
        payload["amount"] = money.amount().minor().into();
        payload["currency"] = money.currency().as_str().into();
    }
    if name == USER_NOTIFY {
        payload["template"] = format!("payment_{}", to.as_str()).into();
    }
    DomainEvent {
        name: name.to_string(),
        order_id: order_id.clone(),
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::id::ProviderEventId;
    use crate::domain::money::{Currency, Money};
    use crate::domain::provider::Provider;
    use chrono::Utc;
    use PaymentStatus::*;

    fn event(kind: EventKind) -> NormalizedEvent {
        NormalizedEvent {
            provider: Provider::Stripe,
            provider_event_id: ProviderEventId::new("evt_sm").unwrap(),
            event_type: "test".into(),
            order_id: Some(OrderId::new("ord_sm").unwrap()),
            kind,
            money: Some(Money::new(MoneyAmount::new(1500).unwrap(), Currency::Usd)),
            reference: Some("ref_1".into()),
            occurred_at: Utc::now(),
        }
    }

    fn names(t: &Transition) -> Vec<&str> {
        t.domain_events().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn intent_created_moves_pending_to_awaiting_payment() {
        let t = transition(Pending, &event(EventKind::IntentCreated)).unwrap();
        assert_eq!(t.next, AwaitingPayment);
        assert_eq!(t.patch().unwrap().payment_intent_ref.as_deref(), Some("ref_1"));
        assert!(names(&t).is_empty());
    }

    #[test]
    fn success_from_processing_fulfills() {
        let t = transition(Processing, &event(EventKind::Succeeded)).unwrap();
        assert_eq!(t.next, Completed);
        assert_eq!(names(&t), vec![ORDER_FULFILLED, USER_NOTIFY]);
        assert_eq!(t.effects[0], Effect::PersistState(Completed));
    }

    #[test]
    fn success_from_awaiting_payment_composes_through_processing() {
        let t = transition(AwaitingPayment, &event(EventKind::Succeeded)).unwrap();
        assert_eq!(t.from, AwaitingPayment);
        assert_eq!(t.next, Completed);
        assert!(!t.is_noop());
    }

    #[test]
    fn new_intent_after_failure_reopens_payment() {
        let t = transition(PaymentFailed, &event(EventKind::IntentCreated)).unwrap();
        assert_eq!(t.next, AwaitingPayment);
    }

    #[test]
    fn retry_request_resets_failed_payment() {
        let t = transition(PaymentFailed, &event(EventKind::RetryRequested)).unwrap();
        assert_eq!(t.next, Pending);
    }

    #[test]
    fn repeated_success_on_completed_is_noop() {
        let t = transition(Completed, &event(EventKind::Succeeded)).unwrap();
        assert!(t.is_noop());
        assert_eq!(t.next, Completed);
    }

    #[test]
    fn refund_before_payment_is_illegal() {
        let err = transition(AwaitingPayment, &event(EventKind::Refunded)).unwrap_err();
        assert_eq!(err.from, AwaitingPayment);
        assert_eq!(err.kind, EventKind::Refunded);
    }

    #[test]
    fn success_after_refund_is_illegal() {
        assert!(transition(Refunded, &event(EventKind::Succeeded)).is_err());
    }

    #[test]
    fn refund_records_amount() {
        let t = transition(Completed, &event(EventKind::Refunded)).unwrap();
        assert_eq!(t.next, Refunded);
        assert_eq!(t.patch().unwrap().refund_delta.minor(), 1500);
        assert_eq!(names(&t), vec![ORDER_REFUNDED, USER_NOTIFY]);
    }

    #[test]
    fn dispute_lifecycle() {
        let opened = transition(Completed, &event(EventKind::DisputeOpened)).unwrap();
        assert_eq!(opened.next, Disputed);
        assert_eq!(opened.patch().unwrap().dispute_ref.as_deref(), Some("ref_1"));

        let won = transition(Disputed, &event(EventKind::DisputeWon)).unwrap();
        assert_eq!(won.next, Completed);
        assert_eq!(names(&won), vec![ORDER_DISPUTE_RESOLVED]);

        let lost = transition(Disputed, &event(EventKind::DisputeLost)).unwrap();
        assert_eq!(lost.next, Refunded);
    }

    #[test]
    fn dispute_won_without_dispute_is_illegal() {
        assert!(transition(Processing, &event(EventKind::DisputeWon)).is_err());
        assert!(transition(Completed, &event(EventKind::DisputeWon)).unwrap().is_noop());
    }

    #[test]
    fn late_success_cannot_close_an_open_dispute() {
        for kind in [EventKind::Succeeded, EventKind::SubscriptionRenewed] {
            let err = transition(Disputed, &event(kind)).unwrap_err();
            assert_eq!(err.from, Disputed);
            assert_eq!(err.kind, kind);
        }
        assert!(transition(Disputed, &event(EventKind::Refunded)).is_ok());
    }

    #[test]
    fn refund_delta_overflow_is_an_error() {
        let t = Transition {
            from: Completed,
            next: Refunded,
            effects: vec![
                Effect::AddRefund(MoneyAmount::new(i64::MAX).unwrap()),
                Effect::AddRefund(MoneyAmount::new(1).unwrap()),
            ],
        };
        assert!(matches!(t.patch(), Err(PipelineError::Validation(_))));
    }

    #[test]
    fn cancellation_restocks() {
        let t = transition(AwaitingPayment, &event(EventKind::Cancelled)).unwrap();
        assert_eq!(t.next, Cancelled);
        assert_eq!(names(&t), vec![INVENTORY_RESTOCK, USER_NOTIFY]);
    }

    #[test]
    fn ignored_kind_never_changes_state() {
        for status in PaymentStatus::ALL {
            assert!(transition(status, &event(EventKind::Ignored)).unwrap().is_noop());
        }
    }

    #[test]
    fn notify_payload_carries_template() {
        let t = transition(Processing, &event(EventKind::Failed)).unwrap();
        let notify = t.domain_events().next().unwrap();
        assert_eq!(notify.payload["template"], "payment_payment_failed");
        assert_eq!(notify.payload["amount"], 1500);
    }
}
