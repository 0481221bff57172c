use {
    crate::domain::{
        error::PipelineError,
        event::{EventKey, EventOutcome, EventStatus, NewWebhookEvent, WebhookEvent},
        id::ProviderEventId,
        provider::Provider,
        store::LeaseToken,
    },
    chrono::{DateTime, Utc},
    sqlx::{PgConnection, PgPool},
};

const COLUMNS: &str = "provider, provider_event_id, event_type, status, outcome, attempt, \
    payload_digest, raw_body, received_at, claimed_at, completed_at, last_error";

#[derive(sqlx::FromRow)]
struct EventRow {
    provider: String,
    provider_event_id: String,
    event_type: String,
    status: String,
    outcome: Option<String>,
    attempt: i32,
    payload_digest: String,
    raw_body: Vec<u8>,
    received_at: DateTime<Utc>,
    claimed_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl TryFrom<EventRow> for WebhookEvent {
    type Error = PipelineError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(WebhookEvent {
            key: EventKey::new(
                Provider::try_from(row.provider.as_str())?,
                ProviderEventId::new(row.provider_event_id)?,
            ),
            event_type: row.event_type,
            status: EventStatus::try_from(row.status.as_str())?,
            outcome: row
                .outcome
                .as_deref()
                .map(EventOutcome::try_from)
                .transpose()?,
            attempt: row.attempt,
            payload_digest: row.payload_digest,
            raw_body: row.raw_body,
            received_at: row.received_at,
            claimed_at: row.claimed_at,
            completed_at: row.completed_at,
            last_error: row.last_error,
        })
    }
}

fn into_events(rows: Vec<EventRow>) -> Result<Vec<WebhookEvent>, PipelineError> {
    rows.into_iter().map(WebhookEvent::try_from).collect()
}

/// `None` when the unique constraint rejected the row.
pub async fn insert_processing(
    pool: &PgPool,
    event: &NewWebhookEvent,
) -> Result<Option<WebhookEvent>, PipelineError> {
    let row: Option<EventRow> = sqlx::query_as(&format!(
        r#"
        INSERT INTO webhook_events
            (provider, provider_event_id, event_type, status, attempt,
             payload_digest, raw_body, received_at, claimed_at)
        VALUES ($1, $2, $3, 'processing', 1, $4, $5, $6, $6)
        ON CONFLICT (provider, provider_event_id) DO NOTHING
        RETURNING {COLUMNS}
        "#
    ))
    .bind(event.key.provider.as_str())
    .bind(event.key.event_id.as_str())
    .bind(&event.event_type)
    .bind(&event.payload_digest)
    .bind(&event.raw_body)
    .bind(event.received_at)
    .fetch_optional(pool)
    .await?;

    row.map(WebhookEvent::try_from).transpose()
}

pub async fn find(pool: &PgPool, key: &EventKey) -> Result<Option<WebhookEvent>, PipelineError> {
    let row: Option<EventRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM webhook_events WHERE provider = $1 AND provider_event_id = $2"
    ))
    .bind(key.provider.as_str())
    .bind(key.event_id.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(WebhookEvent::try_from).transpose()
}

/// CAS on `attempt`; only a `processing` row can be reclaimed.
pub async fn reclaim(
    pool: &PgPool,
    key: &EventKey,
    expected_attempt: i32,
    now: DateTime<Utc>,
) -> Result<Option<WebhookEvent>, PipelineError> {
    let row: Option<EventRow> = sqlx::query_as(&format!(
        r#"
        UPDATE webhook_events
        SET attempt = attempt + 1, claimed_at = $4
        WHERE provider = $1 AND provider_event_id = $2
          AND status = 'processing' AND attempt = $3
        RETURNING {COLUMNS}
        "#
    ))
    .bind(key.provider.as_str())
    .bind(key.event_id.as_str())
    .bind(expected_attempt)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    row.map(WebhookEvent::try_from).transpose()
}

/// Fenced by the lease. Runs on a bare connection so it can join a transaction.
pub async fn complete_under_lease(
    conn: &mut PgConnection,
    lease: &LeaseToken,
    outcome: EventOutcome,
    now: DateTime<Utc>,
) -> Result<bool, PipelineError> {
    let result = sqlx::query(
        r#"
        UPDATE webhook_events
        SET status = 'completed', outcome = $4, completed_at = $5, last_error = NULL
        WHERE provider = $1 AND provider_event_id = $2
          AND status = 'processing' AND attempt = $3
        "#,
    )
    .bind(lease.key.provider.as_str())
    .bind(lease.key.event_id.as_str())
    .bind(lease.attempt)
    .bind(outcome.as_str())
    .bind(now)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn mark_failed(
    pool: &PgPool,
    key: &EventKey,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<(), PipelineError> {
    sqlx::query(
        r#"
        UPDATE webhook_events
        SET status = 'failed', last_error = $3, completed_at = $4
        WHERE provider = $1 AND provider_event_id = $2 AND status = 'processing'
        "#,
    )
    .bind(key.provider.as_str())
    .bind(key.event_id.as_str())
    .bind(reason)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_error(
    pool: &PgPool,
    lease: &LeaseToken,
    error: &str,
) -> Result<(), PipelineError> {
    sqlx::query(
        r#"
        UPDATE webhook_events
        SET last_error = $4
        WHERE provider = $1 AND provider_event_id = $2
          AND status = 'processing' AND attempt = $3
        "#,
    )
    .bind(lease.key.provider.as_str())
    .bind(lease.key.event_id.as_str())
    .bind(lease.attempt)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn stale_processing(
    pool: &PgPool,
    claimed_before: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<WebhookEvent>, PipelineError> {
    let rows: Vec<EventRow> = sqlx::query_as(&format!(
        r#"
        SELECT {COLUMNS} FROM webhook_events
        WHERE status = 'processing' AND claimed_at < $1
        ORDER BY claimed_at
        LIMIT $2
        "#
    ))
    .bind(claimed_before)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    into_events(rows)
}

/// Move, never delete: the archive keeps the audit trail.
pub async fn archive_completed(pool: &PgPool, before: DateTime<Utc>) -> Result<u64, PipelineError> {
    let result = sqlx::query(&format!(
        r#"
        WITH moved AS (
            DELETE FROM webhook_events
            WHERE status = 'completed' AND completed_at < $1
            RETURNING {COLUMNS}
        )
        INSERT INTO webhook_events_archive ({COLUMNS})
        SELECT {COLUMNS} FROM moved
        "#
    ))
    .bind(before)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
