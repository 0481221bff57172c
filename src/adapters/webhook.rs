use {
    super::api_errors::ApiError,
    crate::{AppState, domain::provider::Provider, services::pipeline::ProcessOutcome},
    axum::{
        Json, Router,
        body::Bytes,
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        routing::{get, post},
    },
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/{provider}", post(webhook_handler))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Verify, then hand the event to the pipeline within the request budget.
/// A 2xx means the provider can stop redelivering.
#[tracing::instrument(
    name = "webhook",
    skip_all,
    fields(
        provider = %provider,
        event_id = tracing::field::Empty,
        event_type = tracing::field::Empty
    )
)]
pub async fn webhook_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let provider = Provider::try_from(provider.as_str())
        .map_err(|_| ApiError::UnknownProvider(provider.clone()))?;

    let event = state
        .registry
        .verify(provider, &body, &headers, state.clock.now())
        .inspect_err(|e| tracing::warn!(reason = e.reason(), "rejected webhook: {e}"))?;

    tracing::Span::current()
        .record("event_id", tracing::field::display(&event.provider_event_id))
        .record("event_type", tracing::field::display(&event.event_type));

    let outcome = tokio::time::timeout(state.request_timeout, state.pipeline.handle(&event, &body))
        .await
        .map_err(|_| {
            tracing::warn!("request budget exhausted, leaving event to the supervisor");
            ApiError::Timeout
        })??;

    let status = match outcome {
        ProcessOutcome::InFlight if provider.redelivers() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    Ok((status, Json(serde_json::json!({ "status": outcome.as_str() }))))
}
