use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use tracing::{Span, error, instrument};

use crate::scoring::{BatchScoringRequest, ScoringResult};

use super::error::GatewayError;
use super::state::HandlerState;

/// Parses a raw JSON body into a [`BatchScoringRequest`].
pub fn parse_scoring_request(body: serde_json::Value) -> Result<BatchScoringRequest, GatewayError> {
    serde_json::from_value(body)
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid request schema: {}", e)))
}

/// `POST /scoring`.
///
/// Only a malformed body is an HTTP error. Scoring runs on the blocking pool; if the
/// task panics the batch reports no metrics.
#[instrument(
    skip(state, payload),
    fields(model = tracing::field::Empty, submissions = tracing::field::Empty)
)]
pub async fn scoring_handler(
    State(state): State<HandlerState>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<ScoringResult>, GatewayError> {
    let Json(body) = payload.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    let request = parse_scoring_request(body)?;

    let span = Span::current();
    span.record("model", request.ground_truth_request.model_name.as_str());
    span.record("submissions", request.miner_responses.len());

    let service = state.service.clone();
    let result = tokio::task::spawn_blocking(move || service.score(&request))
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "Scoring task did not complete");
            ScoringResult::empty()
        });

    Ok(Json(result))
}
