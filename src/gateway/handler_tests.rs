use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::IntoResponse,
};
use candle_core::Device;
use http_body_util::BodyExt;
use tower::ServiceExt;

use super::create_router_with_state;
use super::error::GatewayError;
use super::handler::parse_scoring_request;
use super::state::HandlerState;
use crate::constants::{LIVENESS_MESSAGE, LOSS_PENALTY};
use crate::model::mock::{MockModelLoader, ScriptedGenerator};
use crate::payload::CompressedTokens;
use crate::registry::ModelRegistry;
use crate::scoring::{
    Criterion, FixedSelector, MinerSubmission, ScoringService, ScoringSettings,
};

const HIDDEN: usize = MockModelLoader::DEFAULT_HIDDEN_SIZE;

fn router_with(loader: MockModelLoader, criterion: Criterion) -> Router {
    let registry = Arc::new(ModelRegistry::new(Arc::new(loader), Device::Cpu));
    let service = ScoringService::new(registry, ScoringSettings::default())
        .with_selector(Box::new(FixedSelector(criterion)));
    create_router_with_state(HandlerState::new(Arc::new(service)))
}

fn submission(seq_len: usize, hidden: usize) -> String {
    let data = vec![0.05_f32; seq_len * hidden];
    let tokens = CompressedTokens::new(data, seq_len, hidden).unwrap();
    MinerSubmission::from_tokens(&tokens).compressed_tokens_b64
}

fn scoring_body(criteria: &[&str], submissions: Vec<String>) -> serde_json::Value {
    serde_json::json!({
        "ground_truth_request": {
            "model_name": "dummy-model",
            "criterias": criteria,
            "activation_prompt": "The capital of France is",
            "expected_completion": " Paris."
        },
        "miner_responses": submissions
            .into_iter()
            .map(|b64| serde_json::json!({"compressed_tokens_b64": b64}))
            .collect::<Vec<_>>()
    })
}

fn post_json(body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/scoring")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_liveness_route() {
    let app = router_with(MockModelLoader::new(), Criterion::Likelihood);

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        serde_json::json!({"message": LIVENESS_MESSAGE})
    );
}

#[tokio::test]
async fn test_healthz_route() {
    let app = router_with(MockModelLoader::new(), Criterion::Likelihood);

    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, serde_json::json!({"status": "ok"}));
}

#[tokio::test]
async fn test_scoring_loss_round_trip() {
    let app = router_with(MockModelLoader::new(), Criterion::Likelihood);
    let body = scoring_body(
        &["loss"],
        vec![submission(2, HIDDEN), submission(2, HIDDEN + 1), submission(4, HIDDEN)],
    );

    let response = app.oneshot(post_json(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    let losses = json["metrics"]["loss"].as_array().unwrap();
    assert_eq!(losses.len(), 3);
    assert_eq!(losses[1].as_f64().unwrap(), LOSS_PENALTY);
    assert!(losses[0].as_f64().unwrap() >= 0.0);
    assert!(losses[2].as_f64().unwrap() >= 0.0);
}

#[tokio::test]
async fn test_scoring_accuracy_round_trip() {
    let generator = Arc::new(ScriptedGenerator::new("Paris", "yes"));
    let app = router_with(
        MockModelLoader::new().with_generator(generator),
        Criterion::Accuracy,
    );
    let body = scoring_body(&["accuracy"], vec![submission(1, HIDDEN)]);

    let response = app.oneshot(post_json(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        serde_json::json!({"metrics": {"accuracy": [1.0]}})
    );
}

#[tokio::test]
async fn test_scoring_load_failure_returns_empty_metrics() {
    let app = router_with(MockModelLoader::new().failing_times(1), Criterion::Likelihood);
    let body = scoring_body(&["loss"], vec![submission(1, HIDDEN)]);

    let response = app.oneshot(post_json(&body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, serde_json::json!({"metrics": {}}));
}

#[tokio::test]
async fn test_scoring_rejects_wrong_schema() {
    let app = router_with(MockModelLoader::new(), Criterion::Likelihood);
    let body = serde_json::json!({"ground_truth_request": {"model_name": "dummy-model"}});

    let response = app.oneshot(post_json(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = body_json(response).await;
    assert_eq!(json["code"], 400);
    assert!(
        json["error"]
            .as_str()
            .unwrap()
            .contains("Invalid request schema")
    );
}

#[tokio::test]
async fn test_scoring_rejects_malformed_json() {
    let app = router_with(MockModelLoader::new(), Criterion::Likelihood);
    let request = Request::builder()
        .method("POST")
        .uri("/scoring")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], 400);
}

#[tokio::test]
async fn test_scoring_rejects_unknown_criterion() {
    let app = router_with(MockModelLoader::new(), Criterion::Likelihood);
    let body = scoring_body(&["perplexity"], vec![submission(1, HIDDEN)]);

    let response = app.oneshot(post_json(&body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[test]
fn test_parse_scoring_request_accepts_empty_batch() {
    let request = parse_scoring_request(scoring_body(&["loss", "accuracy"], Vec::new())).unwrap();

    assert!(request.miner_responses.is_empty());
    assert_eq!(
        request.ground_truth_request.criteria,
        vec![Criterion::Likelihood, Criterion::Accuracy]
    );
}

#[tokio::test]
async fn test_gateway_error_renders_error_and_code() {
    let response = GatewayError::InvalidRequest("missing field".to_string()).into_response();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await,
        serde_json::json!({"error": "invalid request: missing field", "code": 400})
    );
}
