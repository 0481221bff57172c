use {
    crate::domain::{
        error::PipelineError,
        id::OrderId,
        money::MoneyAmount,
        payment::{OrderPatch, OrderPaymentState, PaymentStatus},
    },
    chrono::{DateTime, Utc},
    sqlx::{PgConnection, PgPool},
};

#[derive(sqlx::FromRow)]
struct OrderRow {
    order_id: String,
    payment_status: String,
    payment_intent_ref: Option<String>,
    refunded_amount: i64,
    dispute_ref: Option<String>,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for OrderPaymentState {
    type Error = PipelineError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(OrderPaymentState {
            order_id: OrderId::new(row.order_id)?,
            status: PaymentStatus::try_from(row.payment_status.as_str())?,
            payment_intent_ref: row.payment_intent_ref,
            refunded_amount: MoneyAmount::new(row.refunded_amount)?,
            dispute_ref: row.dispute_ref,
            version: row.version,
            updated_at: row.updated_at,
        })
    }
}

pub async fn load(
    pool: &PgPool,
    order_id: &OrderId,
) -> Result<Option<OrderPaymentState>, PipelineError> {
    let row: Option<OrderRow> = sqlx::query_as(
        r#"
        SELECT order_id, payment_status, payment_intent_ref, refunded_amount,
               dispute_ref, version, updated_at
        FROM order_payment_states
        WHERE order_id = $1
        "#,
    )
    .bind(order_id.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(OrderPaymentState::try_from).transpose()
}

/// Orders are created by the order domain; this exists for seeding.
pub async fn insert(pool: &PgPool, state: &OrderPaymentState) -> Result<(), PipelineError> {
    sqlx::query(
        r#"
        INSERT INTO order_payment_states
            (order_id, payment_status, payment_intent_ref, refunded_amount,
             dispute_ref, version, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(state.order_id.as_str())
    .bind(state.status.as_str())
    .bind(&state.payment_intent_ref)
    .bind(state.refunded_amount.minor())
    .bind(&state.dispute_ref)
    .bind(state.version)
    .bind(state.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Versioned write. `None` means someone else moved the row first.
pub async fn apply_patch(
    conn: &mut PgConnection,
    order_id: &OrderId,
    expected_version: i64,
    patch: &OrderPatch,
    now: DateTime<Utc>,
) -> Result<Option<i64>, PipelineError> {
    let version: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE order_payment_states
        SET payment_status     = $3,
            payment_intent_ref = COALESCE($4, payment_intent_ref),
            refunded_amount    = refunded_amount + $5,
            dispute_ref        = COALESCE($6, dispute_ref),
            version            = version + 1,
            updated_at         = $7
        WHERE order_id = $1 AND version = $2
        RETURNING version
        "#,
    )
    .bind(order_id.as_str())
    .bind(expected_version)
    .bind(patch.status.as_str())
    .bind(&patch.payment_intent_ref)
    .bind(patch.refund_delta.minor())
    .bind(&patch.dispute_ref)
    .bind(now)
    .fetch_optional(conn)
    .await?;

    Ok(version)
}
