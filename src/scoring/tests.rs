use std::sync::Arc;

use candle_core::Device;
use proptest::prelude::*;

use super::tensors::{build_labels, shift_labels};
use super::*;
use crate::constants::{EMPTY_COMPLETION_FALLBACK, IGNORE_INDEX, LOSS_PENALTY};
use crate::model::mock::{MockModelLoader, ScriptedGenerator};
use crate::model::{ModelError, TokenCodec};
use crate::payload::CompressedTokens;
use crate::registry::ModelRegistry;

const MODEL: &str = "dummy-model";
const HIDDEN: usize = MockModelLoader::DEFAULT_HIDDEN_SIZE;

fn compressed(seq_len: usize, hidden: usize) -> CompressedTokens {
    let data = (0..seq_len * hidden)
        .map(|i| ((i as f32) * 0.37).sin() * 0.1)
        .collect();
    CompressedTokens::new(data, seq_len, hidden).unwrap()
}

fn request(criteria: Vec<Criterion>, submissions: Vec<MinerSubmission>) -> BatchScoringRequest {
    BatchScoringRequest {
        ground_truth_request: GroundTruthSpec {
            model_name: MODEL.to_string(),
            criteria,
            activation_prompt: "The capital of France is".to_string(),
            expected_completion: " Paris.".to_string(),
        },
        miner_responses: submissions,
    }
}

fn service_with(loader: MockModelLoader, criterion: Criterion) -> (ScoringService, Arc<MockModelLoader>) {
    let loader = Arc::new(loader);
    let registry = Arc::new(ModelRegistry::new(loader.clone(), Device::Cpu));
    let service = ScoringService::new(registry, ScoringSettings::default())
        .with_selector(Box::new(FixedSelector(criterion)));
    (service, loader)
}

struct BrokenTokenizer;

impl TokenCodec for BrokenTokenizer {
    fn encode(&self, _text: &str, _add_special_tokens: bool) -> Result<Vec<u32>, ModelError> {
        Err(ModelError::TokenizationFailed {
            reason: "broken".to_string(),
        })
    }

    fn decode(&self, _ids: &[u32], _skip_special_tokens: bool) -> Result<String, ModelError> {
        Ok(String::new())
    }

    fn token_to_id(&self, _token: &str) -> Option<u32> {
        None
    }
}

#[test]
fn test_likelihood_scores_align_with_submissions() {
    let (service, _) = service_with(MockModelLoader::new(), Criterion::Likelihood);
    let submissions = vec![
        MinerSubmission::from_tokens(&compressed(3, HIDDEN)),
        MinerSubmission::from_tokens(&compressed(1, HIDDEN)),
        MinerSubmission::from_tokens(&compressed(7, HIDDEN)),
    ];

    let result = service.score(&request(vec![Criterion::Likelihood], submissions));

    let losses = result.get(Criterion::Likelihood).unwrap();
    assert_eq!(losses.len(), 3);
    for loss in losses {
        assert!(loss.is_finite());
        assert!(*loss >= 0.0);
        assert_ne!(*loss, LOSS_PENALTY);
    }
    assert!(result.get(Criterion::Accuracy).is_none());
}

#[test]
fn test_malformed_submissions_get_loss_penalty() {
    let (service, _) = service_with(MockModelLoader::new(), Criterion::Likelihood);
    let submissions = vec![
        MinerSubmission::from_tokens(&compressed(2, HIDDEN)),
        MinerSubmission::from_tokens(&compressed(2, HIDDEN + 1)),
        MinerSubmission::new("%%% not base64 %%%"),
        MinerSubmission::from_tokens(&compressed(2, HIDDEN)),
    ];

    let result = service.score(&request(vec![Criterion::Likelihood], submissions));

    let losses = result.get(Criterion::Likelihood).unwrap();
    assert_eq!(losses.len(), 4);
    assert_eq!(losses[1], LOSS_PENALTY);
    assert_eq!(losses[2], LOSS_PENALTY);
    assert_ne!(losses[0], LOSS_PENALTY);
    assert_ne!(losses[3], LOSS_PENALTY);
}

#[test]
fn test_identical_submissions_score_identically() {
    let (service, _) = service_with(MockModelLoader::new(), Criterion::Likelihood);
    let tokens = compressed(4, HIDDEN);
    let submissions = vec![
        MinerSubmission::from_tokens(&tokens),
        MinerSubmission::from_tokens(&tokens),
    ];

    let result = service.score(&request(vec![Criterion::Likelihood], submissions));
    let losses = result.get(Criterion::Likelihood).unwrap();
    assert!((losses[0] - losses[1]).abs() < 1e-9);
}

#[test]
fn test_accuracy_uses_judge_verdict() {
    let generator = Arc::new(ScriptedGenerator::new("Paris.", "yes"));
    let (service, _) = service_with(
        MockModelLoader::new().with_generator(generator.clone()),
        Criterion::Accuracy,
    );
    let submissions = vec![
        MinerSubmission::from_tokens(&compressed(3, HIDDEN)),
        MinerSubmission::from_tokens(&compressed(3, HIDDEN * 2)),
        MinerSubmission::from_tokens(&compressed(5, HIDDEN)),
    ];

    let result = service.score(&request(vec![Criterion::Accuracy], submissions));

    assert_eq!(result.get(Criterion::Accuracy).unwrap(), &[1.0, 0.0, 1.0]);
    assert_eq!(generator.completion_calls(), 2);
    assert_eq!(generator.prompts().len(), 2);
}

#[test]
fn test_accuracy_judge_sees_expected_and_generated_text() {
    let generator = Arc::new(
        ScriptedGenerator::new("London.", "unused").with_judge(|prompt| {
            if prompt.contains("- Model completion: Paris.") {
                "yes".to_string()
            } else {
                "no".to_string()
            }
        }),
    );
    let (service, _) = service_with(
        MockModelLoader::new().with_generator(generator.clone()),
        Criterion::Accuracy,
    );

    let submissions = vec![MinerSubmission::from_tokens(&compressed(2, HIDDEN))];
    let result = service.score(&request(vec![Criterion::Accuracy], submissions));

    assert_eq!(result.get(Criterion::Accuracy).unwrap(), &[0.0]);
    let prompt = &generator.prompts()[0];
    assert!(prompt.contains("- Ground truth completion:  Paris.\n"));
    assert!(prompt.contains("- Model completion: London.\n"));
}

#[test]
fn test_empty_completion_falls_back_to_placeholder() {
    let generator = Arc::new(ScriptedGenerator::new("   ", "no"));
    let (service, _) = service_with(
        MockModelLoader::new().with_generator(generator.clone()),
        Criterion::Accuracy,
    );

    let submissions = vec![MinerSubmission::from_tokens(&compressed(2, HIDDEN))];
    let result = service.score(&request(vec![Criterion::Accuracy], submissions));

    assert_eq!(result.get(Criterion::Accuracy).unwrap(), &[0.0]);
    let expected = format!("- Model completion: {}\n", EMPTY_COMPLETION_FALLBACK);
    assert!(generator.prompts()[0].contains(&expected));
}

#[test]
fn test_generation_failure_scores_zero() {
    let generator = Arc::new(ScriptedGenerator::new("Paris.", "yes").failing_completion());
    let (service, _) = service_with(
        MockModelLoader::new().with_generator(generator.clone()),
        Criterion::Accuracy,
    );

    let submissions = vec![
        MinerSubmission::from_tokens(&compressed(2, HIDDEN)),
        MinerSubmission::from_tokens(&compressed(2, HIDDEN)),
    ];
    let result = service.score(&request(vec![Criterion::Accuracy], submissions));

    assert_eq!(result.get(Criterion::Accuracy).unwrap(), &[0.0, 0.0]);
    assert!(generator.prompts().is_empty());
}

#[test]
fn test_accuracy_with_decoder_generation_is_binary() {
    let (service, _) = service_with(MockModelLoader::new(), Criterion::Accuracy);
    let submissions = vec![
        MinerSubmission::from_tokens(&compressed(2, HIDDEN)),
        MinerSubmission::from_tokens(&compressed(2, HIDDEN + 3)),
    ];

    let result = service.score(&request(vec![Criterion::Accuracy], submissions));

    let scores = result.get(Criterion::Accuracy).unwrap();
    assert_eq!(scores.len(), 2);
    assert!(scores.iter().all(|s| *s == 0.0 || *s == 1.0));
    assert_eq!(scores[1], 0.0);
}

#[test]
fn test_ground_truth_failure_empties_criterion() {
    let (service, _) = service_with(
        MockModelLoader::new().with_tokenizer(Arc::new(BrokenTokenizer)),
        Criterion::Likelihood,
    );
    let submissions = vec![MinerSubmission::from_tokens(&compressed(2, HIDDEN))];

    let result = service.score(&request(vec![Criterion::Likelihood], submissions));

    assert_eq!(result.get(Criterion::Likelihood), Some(&[][..]));
}

#[test]
fn test_model_load_failure_yields_empty_metrics() {
    let (service, loader) = service_with(MockModelLoader::new().failing_times(1), Criterion::Likelihood);
    let submissions = vec![MinerSubmission::from_tokens(&compressed(2, HIDDEN))];
    let batch = request(vec![Criterion::Likelihood], submissions);

    assert!(service.score(&batch).is_empty());

    let retried = service.score(&batch);
    assert_eq!(retried.get(Criterion::Likelihood).unwrap().len(), 1);
    assert_eq!(loader.load_count(), 2);
}

#[test]
fn test_empty_criteria_yields_empty_metrics() {
    let loader = Arc::new(MockModelLoader::new());
    let registry = Arc::new(ModelRegistry::new(loader, Device::Cpu));
    let service = ScoringService::new(registry, ScoringSettings::default());

    let submissions = vec![MinerSubmission::from_tokens(&compressed(2, HIDDEN))];
    assert!(service.score(&request(Vec::new(), submissions)).is_empty());
}

#[test]
fn test_single_allowed_criterion_is_always_used() {
    let loader = Arc::new(MockModelLoader::new());
    let registry = Arc::new(ModelRegistry::new(loader, Device::Cpu));
    let service = ScoringService::new(registry, ScoringSettings::default());

    for _ in 0..5 {
        let submissions = vec![MinerSubmission::from_tokens(&compressed(2, HIDDEN))];
        let result = service.score(&request(vec![Criterion::Likelihood], submissions));
        assert_eq!(result.metrics.len(), 1);
        assert!(result.get(Criterion::Likelihood).is_some());
    }
}

#[test]
fn test_empty_batch_scores_nothing() {
    let (service, _) = service_with(MockModelLoader::new(), Criterion::Likelihood);
    let result = service.score(&request(vec![Criterion::Likelihood], Vec::new()));
    assert_eq!(result.get(Criterion::Likelihood), Some(&[][..]));
}

#[test]
fn test_request_wire_format() {
    let body = serde_json::json!({
        "ground_truth_request": {
            "model_name": MODEL,
            "criterias": ["loss", "generation"],
            "activation_prompt": "The capital of France is",
            "expected_completion": " Paris."
        },
        "miner_responses": [{"compressed_tokens_b64": "AAAA"}]
    });

    let parsed: BatchScoringRequest = serde_json::from_value(body).unwrap();
    assert_eq!(
        parsed.ground_truth_request.criteria,
        vec![Criterion::Likelihood, Criterion::Accuracy]
    );
    assert_eq!(parsed.miner_responses[0].compressed_tokens_b64, "AAAA");
}

#[test]
fn test_unknown_criterion_is_rejected() {
    let body = serde_json::json!({
        "model_name": MODEL,
        "criterias": ["perplexity"],
        "activation_prompt": "",
        "expected_completion": ""
    });
    assert!(serde_json::from_value::<GroundTruthSpec>(body).is_err());
}

#[test]
fn test_result_wire_format() {
    let result = ScoringResult::from_outcomes(
        Criterion::Likelihood,
        &[
            SubmissionOutcome::Scored(2.5),
            SubmissionOutcome::failed("bad shape"),
        ],
    );
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json, serde_json::json!({"metrics": {"loss": [2.5, 1000.0]}}));

    let empty = serde_json::to_value(ScoringResult::empty()).unwrap();
    assert_eq!(empty, serde_json::json!({"metrics": {}}));
}

#[test]
fn test_outcome_projection_uses_criterion_penalty() {
    let failed = SubmissionOutcome::failed("x");
    assert_eq!(failed.score_or(Criterion::Likelihood.penalty()), 1000.0);
    assert_eq!(failed.score_or(Criterion::Accuracy.penalty()), 0.0);
    assert_eq!(SubmissionOutcome::Scored(0.5).score_or(1000.0), 0.5);
}

#[test]
fn test_fixed_selector_requires_membership() {
    let selector = FixedSelector(Criterion::Accuracy);
    assert_eq!(selector.select(&[Criterion::Accuracy]), Some(Criterion::Accuracy));
    assert_eq!(selector.select(&[Criterion::Likelihood]), None);
}

fn criterion_strategy() -> impl Strategy<Value = Criterion> {
    prop_oneof![Just(Criterion::Likelihood), Just(Criterion::Accuracy)]
}

proptest! {
    #[test]
    fn prop_uniform_selector_picks_an_allowed_member(
        allowed in proptest::collection::vec(criterion_strategy(), 0..6)
    ) {
        let selected = UniformSelector.select(&allowed);
        match selected {
            None => prop_assert!(allowed.is_empty()),
            Some(criterion) => prop_assert!(allowed.contains(&criterion)),
        }
    }

    #[test]
    fn prop_single_distinct_member_is_always_selected(
        criterion in criterion_strategy(),
        repeats in 1usize..5
    ) {
        let allowed = vec![criterion; repeats];
        prop_assert_eq!(UniformSelector.select(&allowed), Some(criterion));
    }

    #[test]
    fn prop_labels_mask_only_the_compressed_span(
        compressed_len in 0usize..16,
        prompt in proptest::collection::vec(0u32..50_000, 0..12),
        completion in proptest::collection::vec(0u32..50_000, 0..12)
    ) {
        let labels = build_labels(compressed_len, &prompt, &completion);
        prop_assert_eq!(labels.len(), compressed_len + prompt.len() + completion.len());
        prop_assert!(labels[..compressed_len].iter().all(|&l| l == IGNORE_INDEX));

        let text: Vec<i64> = prompt.iter().chain(&completion).map(|&id| i64::from(id)).collect();
        prop_assert_eq!(&labels[compressed_len..], text.as_slice());

        let shifted = shift_labels(&labels);
        prop_assert_eq!(shifted.len(), labels.len().saturating_sub(1));
    }
}
