mod common;

use common::*;
use pay_sync::config::DispatchConfig;
use pay_sync::domain::error::PipelineError;
use pay_sync::domain::event::{EventOutcome, EventStatus};
use pay_sync::domain::payment::PaymentStatus;
use pay_sync::domain::provider::Provider;
use pay_sync::domain::state_machine::{ORDER_FULFILLED, ORDER_REFUNDED, USER_NOTIFY};
use pay_sync::services::pipeline::ProcessOutcome;
use serde_json::json;
use std::time::Duration;

// ── A. same event delivered twice ──────────────────────────────────────────

#[tokio::test]
async fn duplicate_delivery_applies_once() {
    let h = Harness::new();
    let order = h.seed_order("ord_a", PaymentStatus::AwaitingPayment).await;
    let delivery = h.stripe("evt_a", "payment_intent.succeeded", payment_intent("ord_a", 5000));

    assert_eq!(h.deliver(&delivery).await.unwrap(), ProcessOutcome::Applied);
    assert_eq!(h.deliver(&delivery).await.unwrap(), ProcessOutcome::Duplicate);

    let state = h.order(&order).await;
    assert_eq!(state.status, PaymentStatus::Completed);
    assert_eq!(state.version, 1);
    assert_eq!(state.payment_intent_ref.as_deref(), Some("pi_ord_a"));

    let outbox = h.store.outbox().await;
    let names: Vec<_> = outbox.iter().map(|e| e.event.name.as_str()).collect();
    assert_eq!(names, vec![ORDER_FULFILLED, USER_NOTIFY]);

    let row = h.store.event(&delivery.key()).await.unwrap();
    assert_eq!(row.status, EventStatus::Completed);
    assert_eq!(row.outcome, Some(EventOutcome::Applied));
    assert_eq!(row.attempt, 1);
}

#[tokio::test]
async fn many_deliveries_leave_one_row_and_one_transition() {
    let h = Harness::new();
    let order = h.seed_order("ord_n", PaymentStatus::AwaitingPayment).await;
    let delivery = h.stripe("evt_n", "payment_intent.succeeded", payment_intent("ord_n", 700));

    let mut outcomes = Vec::new();
    for _ in 0..5 {
        outcomes.push(h.deliver(&delivery).await.unwrap());
    }

    assert_eq!(outcomes[0], ProcessOutcome::Applied);
    assert!(outcomes[1..].iter().all(|o| *o == ProcessOutcome::Duplicate));
    assert_eq!(h.store.event_count().await, 1);
    assert_eq!(h.order(&order).await.version, 1);
    assert_eq!(h.store.outbox().await.len(), 2);
    assert_eq!(h.telemetry.processed(Provider::Stripe, "duplicate"), 4);
}

#[tokio::test]
async fn duplicate_is_detected_by_the_store_when_cache_is_down() {
    let h = Harness::new();
    h.seed_order("ord_c", PaymentStatus::AwaitingPayment).await;
    let delivery = h.stripe("evt_c", "payment_intent.succeeded", payment_intent("ord_c", 100));

    h.cache.set_unavailable(true);
    assert_eq!(h.deliver(&delivery).await.unwrap(), ProcessOutcome::Applied);
    assert_eq!(h.deliver(&delivery).await.unwrap(), ProcessOutcome::Duplicate);
    assert_eq!(h.store.outbox().await.len(), 2);
}

// ── B. retransmission under a new event id ─────────────────────────────────

#[tokio::test]
async fn reentering_completed_is_a_noop() {
    let h = Harness::new();
    let order = h.seed_order("ord_b", PaymentStatus::Completed).await;
    let delivery = h.stripe("evt_b2", "payment_intent.succeeded", payment_intent("ord_b", 5000));

    assert_eq!(h.deliver(&delivery).await.unwrap(), ProcessOutcome::NoOp);

    let state = h.order(&order).await;
    assert_eq!(state.status, PaymentStatus::Completed);
    assert_eq!(state.version, 0);
    assert!(h.store.outbox().await.is_empty());
    assert_eq!(h.telemetry.illegal(), 0);

    let row = h.store.event(&delivery.key()).await.unwrap();
    assert_eq!(row.status, EventStatus::Completed);
    assert_eq!(row.outcome, Some(EventOutcome::Noop));
}

// ── C. event the graph does not allow ──────────────────────────────────────

#[tokio::test]
async fn illegal_event_is_acknowledged_without_change() {
    let h = Harness::new();
    let order = h.seed_order("ord_i", PaymentStatus::AwaitingPayment).await;
    let delivery = h.stripe("evt_i", "charge.refunded", charge_refund("ord_i", 5000));

    assert_eq!(h.deliver(&delivery).await.unwrap(), ProcessOutcome::Illegal);

    let state = h.order(&order).await;
    assert_eq!(state.status, PaymentStatus::AwaitingPayment);
    assert_eq!(state.version, 0);
    assert!(h.store.outbox().await.is_empty());
    assert_eq!(h.telemetry.illegal(), 1);

    let row = h.store.event(&delivery.key()).await.unwrap();
    assert_eq!(row.status, EventStatus::Completed);
    assert_eq!(row.outcome, Some(EventOutcome::Illegal));
}

// ── Lifecycle ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn refunds_accumulate_and_emit_in_order() {
    let h = Harness::new();
    let order = h.seed_order("ord_r", PaymentStatus::Pending).await;

    let steps = [
        ("evt_r1", "payment_intent.created", payment_intent("ord_r", 9000)),
        ("evt_r2", "payment_intent.processing", payment_intent("ord_r", 9000)),
        ("evt_r3", "payment_intent.succeeded", payment_intent("ord_r", 9000)),
        ("evt_r4", "charge.refunded", charge_refund("ord_r", 9000)),
    ];
    for (id, kind, object) in steps {
        let outcome = h.deliver(&h.stripe(id, kind, object)).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Applied, "{kind}");
    }

    let state = h.order(&order).await;
    assert_eq!(state.status, PaymentStatus::Refunded);
    assert_eq!(state.version, 4);
    assert_eq!(state.refunded_amount.minor(), 9000);

    let names: Vec<_> = h
        .store
        .outbox()
        .await
        .into_iter()
        .map(|e| e.event.name)
        .collect();
    assert_eq!(names, vec![ORDER_FULFILLED, USER_NOTIFY, ORDER_REFUNDED, USER_NOTIFY]);
}

#[tokio::test]
async fn dispute_opened_then_won_returns_to_completed() {
    let h = Harness::new();
    let order = h.seed_order("ord_d", PaymentStatus::Completed).await;
    let dispute = |status: &str| {
        json!({
            "id": "dp_1",
            "object": "dispute",
            "amount": 5000,
            "currency": "usd",
            "status": status,
            "metadata": {"order_id": "ord_d"},
        })
    };

    let opened = h.stripe("evt_d1", "charge.dispute.created", dispute("needs_response"));
    assert_eq!(h.deliver(&opened).await.unwrap(), ProcessOutcome::Applied);
    let state = h.order(&order).await;
    assert_eq!(state.status, PaymentStatus::Disputed);
    assert_eq!(state.dispute_ref.as_deref(), Some("dp_1"));

    let won = h.stripe("evt_d2", "charge.dispute.closed", dispute("won"));
    assert_eq!(h.deliver(&won).await.unwrap(), ProcessOutcome::Applied);
    assert_eq!(h.order(&order).await.status, PaymentStatus::Completed);
}

#[tokio::test]
async fn late_success_leaves_an_open_dispute_alone() {
    let h = Harness::new();
    let order = h.seed_order("ord_dl", PaymentStatus::Completed).await;
    let opened = h.stripe(
        "evt_dl1",
        "charge.dispute.created",
        json!({
            "id": "dp_2",
            "object": "dispute",
            "amount": 700,
            "currency": "usd",
            "status": "needs_response",
            "metadata": {"order_id": "ord_dl"},
        }),
    );
    assert_eq!(h.deliver(&opened).await.unwrap(), ProcessOutcome::Applied);
    let queued = h.store.outbox().await.len();

    let late = h.stripe("evt_dl2", "payment_intent.succeeded", payment_intent("ord_dl", 700));
    assert_eq!(h.deliver(&late).await.unwrap(), ProcessOutcome::Illegal);

    let state = h.order(&order).await;
    assert_eq!(state.status, PaymentStatus::Disputed);
    assert_eq!(state.version, 1);
    assert_eq!(h.store.outbox().await.len(), queued, "no second fulfilment");
}

#[tokio::test]
async fn unrecognized_and_orderless_events_are_ignored() {
    let h = Harness::new();
    let order = h.seed_order("ord_u", PaymentStatus::AwaitingPayment).await;

    let unknown = h.stripe("evt_u1", "customer.created", json!({"id": "cus_1"}));
    assert_eq!(h.deliver(&unknown).await.unwrap(), ProcessOutcome::Ignored);

    let orderless = h.stripe(
        "evt_u2",
        "payment_intent.succeeded",
        json!({"id": "pi_x", "amount": 100, "currency": "usd"}),
    );
    assert_eq!(h.deliver(&orderless).await.unwrap(), ProcessOutcome::Ignored);

    assert_eq!(h.order(&order).await.version, 0);
    let row = h.store.event(&orderless.key()).await.unwrap();
    assert_eq!(row.outcome, Some(EventOutcome::Ignored));
}

// ── Transient failures stay claimable ──────────────────────────────────────

#[tokio::test]
async fn unknown_order_leaves_event_processing() {
    let h = Harness::new();
    let delivery = h.stripe("evt_o", "payment_intent.succeeded", payment_intent("ord_missing", 10));

    let err = h.deliver(&delivery).await.unwrap_err();
    assert!(matches!(err, PipelineError::OrderNotFound(_)));

    let row = h.store.event(&delivery.key()).await.unwrap();
    assert_eq!(row.status, EventStatus::Processing);
    assert!(row.last_error.is_some());
    assert_eq!(h.telemetry.processed(Provider::Stripe, "error"), 1);
}

#[tokio::test]
async fn redelivery_while_processing_is_in_flight() {
    let h = Harness::new();
    h.store.set_commit_outage(true);
    h.seed_order("ord_f", PaymentStatus::AwaitingPayment).await;
    let delivery = h.stripe("evt_f", "payment_intent.succeeded", payment_intent("ord_f", 10));

    assert!(matches!(
        h.deliver(&delivery).await.unwrap_err(),
        PipelineError::Storage(_)
    ));
    assert_eq!(h.deliver(&delivery).await.unwrap(), ProcessOutcome::InFlight);
}

#[tokio::test]
async fn version_conflicts_are_retried() {
    let h = Harness::new();
    let order = h.seed_order("ord_v", PaymentStatus::AwaitingPayment).await;
    h.store.inject_version_conflicts(2);

    let delivery = h.stripe("evt_v", "payment_intent.succeeded", payment_intent("ord_v", 10));
    assert_eq!(h.deliver(&delivery).await.unwrap(), ProcessOutcome::Applied);
    assert_eq!(h.order(&order).await.version, 1);
}

#[tokio::test]
async fn exhausted_conflict_retries_surface_contention() {
    let h = Harness::with_dispatch(DispatchConfig {
        max_conflict_retries: 2,
        conflict_backoff: Duration::from_millis(1),
    });
    let order = h.seed_order("ord_x", PaymentStatus::AwaitingPayment).await;
    h.store.inject_version_conflicts(10);

    let delivery = h.stripe("evt_x", "payment_intent.succeeded", payment_intent("ord_x", 10));
    let err = h.deliver(&delivery).await.unwrap_err();
    assert!(matches!(err, PipelineError::Contention { attempts: 3, .. }));

    assert_eq!(h.order(&order).await.version, 0);
    let row = h.store.event(&delivery.key()).await.unwrap();
    assert_eq!(row.status, EventStatus::Processing);
    assert!(h.store.outbox().await.is_empty());
}
