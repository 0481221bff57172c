use {
    crate::domain::{
        error::PipelineError,
        id::OrderId,
        state_machine::DomainEvent,
        store::OutboxEntry,
    },
    chrono::{DateTime, Utc},
    sqlx::{PgConnection, PgPool},
    uuid::Uuid,
};

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    name: String,
    order_id: String,
    payload: serde_json::Value,
    attempts: i32,
    created_at: DateTime<Utc>,
}

impl TryFrom<OutboxRow> for OutboxEntry {
    type Error = PipelineError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(OutboxEntry {
            id: row.id,
            event: DomainEvent {
                name: row.name,
                order_id: OrderId::new(row.order_id)?,
                payload: row.payload,
            },
            attempts: row.attempts,
            created_at: row.created_at,
        })
    }
}

/// Joins the caller's transaction so the event commits with the state change.
pub async fn enqueue(
    conn: &mut PgConnection,
    event: &DomainEvent,
    now: DateTime<Utc>,
) -> Result<Uuid, PipelineError> {
    let id = Uuid::now_v7();
    sqlx::query(
        r#"
        INSERT INTO domain_event_outbox (id, name, order_id, payload, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(id)
    .bind(&event.name)
    .bind(event.order_id.as_str())
    .bind(&event.payload)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(id)
}

pub async fn pending(pool: &PgPool, limit: i64) -> Result<Vec<OutboxEntry>, PipelineError> {
    let rows: Vec<OutboxRow> = sqlx::query_as(
        r#"
        SELECT id, name, order_id, payload, attempts, created_at
        FROM domain_event_outbox
        WHERE status = 'pending'
        ORDER BY created_at, id
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(OutboxEntry::try_from).collect()
}

pub async fn mark_published(
    pool: &PgPool,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), PipelineError> {
    sqlx::query(
        "UPDATE domain_event_outbox SET status = 'published', published_at = $2 WHERE id = $1",
    )
    .bind(id)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_failed(pool: &PgPool, id: Uuid, error: &str) -> Result<(), PipelineError> {
    sqlx::query(
        "UPDATE domain_event_outbox SET attempts = attempts + 1, last_error = $2 WHERE id = $1",
    )
    .bind(id)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}
