//! HTTP gateway (Axum) exposing the scoring service.

#![allow(missing_docs)]

pub mod error;
pub mod handler;
pub mod state;

#[cfg(test)]
mod handler_tests;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

pub use error::{ErrorResponse, GatewayError};
pub use handler::scoring_handler;
pub use state::HandlerState;

use crate::constants::LIVENESS_MESSAGE;

pub fn create_router_with_state(state: HandlerState) -> Router {
    Router::new()
        .route("/", get(liveness_handler))
        .route("/healthz", get(health_handler))
        .route("/scoring", post(scoring_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(serde::Serialize)]
pub struct LivenessResponse {
    pub message: &'static str,
}

#[derive(serde::Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[tracing::instrument]
pub async fn liveness_handler() -> Response {
    (
        StatusCode::OK,
        Json(LivenessResponse {
            message: LIVENESS_MESSAGE,
        }),
    )
        .into_response()
}

#[tracing::instrument]
pub async fn health_handler() -> Response {
    (StatusCode::OK, Json(HealthResponse { status: "ok" })).into_response()
}
