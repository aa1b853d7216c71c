use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;

use ingest_api::{ErrorKind, PartitionId};
use ingest_engine::Health;

use super::ApiState;

// ═══════════════════════════════════════════════════════════════
//  GET /health
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_health(State(state): State<ApiState>) -> impl IntoResponse {
    let health = state.health.borrow().clone();
    let status = match health {
        Health::Healthy => StatusCode::OK,
        Health::Fatal(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, axum::Json(health)).into_response()
}

// ═══════════════════════════════════════════════════════════════
//  GET /metrics
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    axum::Json(state.metrics.snapshot()).into_response()
}

// ═══════════════════════════════════════════════════════════════
//  POST /api/partitions/{partition}/messages?schema=<id>
// ═══════════════════════════════════════════════════════════════

#[derive(Deserialize)]
pub(crate) struct PublishParams {
    schema: Option<String>,
}

pub(crate) async fn handle_publish(
    State(state): State<ApiState>,
    Path(partition): Path<PartitionId>,
    Query(params): Query<PublishParams>,
    body: Bytes,
) -> impl IntoResponse {
    let Some(publisher) = &state.publisher else {
        return (StatusCode::NOT_FOUND, "publish ingress is disabled").into_response();
    };

    match publisher
        .publish(&state.topic, partition, params.schema, body.to_vec())
        .await
    {
        Ok(offset) => (
            StatusCode::ACCEPTED,
            axum::Json(serde_json::json!({ "partition": partition, "offset": offset })),
        )
            .into_response(),
        Err(e) => {
            let status = match e.kind {
                ErrorKind::Config | ErrorKind::Format => StatusCode::BAD_REQUEST,
                ErrorKind::Io | ErrorKind::Logic => StatusCode::BAD_GATEWAY,
            };
            (status, format!("error: {e}")).into_response()
        }
    }
}
