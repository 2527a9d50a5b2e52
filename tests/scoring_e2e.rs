//! End-to-end scoring scenarios against randomly initialised decoders.

use std::sync::Arc;

use candle_core::{DType, Device};

use oracle::constants::{EMPTY_COMPLETION_FALLBACK, LOSS_PENALTY};
use oracle::model::PretrainedLoader;
use oracle::model::mock::{MockModelLoader, ScriptedGenerator, write_fixture_checkpoint};
use oracle::registry::ModelRegistry;
use oracle::scoring::{
    BatchScoringRequest, Criterion, FixedSelector, GroundTruthSpec, MinerSubmission,
    ScoringService, ScoringSettings,
};
use oracle::{CompressedTokens, ScoringResult};

const HIDDEN: usize = MockModelLoader::DEFAULT_HIDDEN_SIZE;

fn submission(seq_len: usize, hidden: usize, seed: f32) -> MinerSubmission {
    let data = (0..seq_len * hidden)
        .map(|i| ((i as f32 + seed) * 0.11).cos() * 0.2)
        .collect();
    MinerSubmission::from_tokens(&CompressedTokens::new(data, seq_len, hidden).unwrap())
}

fn batch(criteria: Vec<Criterion>, miner_responses: Vec<MinerSubmission>) -> BatchScoringRequest {
    BatchScoringRequest {
        ground_truth_request: GroundTruthSpec {
            model_name: "dummy-model".to_string(),
            criteria,
            activation_prompt: "The capital of France is".to_string(),
            expected_completion: " Paris.".to_string(),
        },
        miner_responses,
    }
}

fn service(loader: MockModelLoader) -> ScoringService {
    let registry = Arc::new(ModelRegistry::new(Arc::new(loader), Device::Cpu));
    ScoringService::new(registry, ScoringSettings::default())
}

#[test]
fn likelihood_batch_penalises_wrong_hidden_size() {
    let service = service(MockModelLoader::new());
    let request = batch(
        vec![Criterion::Likelihood],
        vec![
            submission(4, HIDDEN, 0.0),
            submission(4, HIDDEN + 3, 1.0),
            submission(2, HIDDEN, 2.0),
        ],
    );

    let result = service.score(&request);

    let losses = result.get(Criterion::Likelihood).unwrap();
    assert_eq!(losses.len(), 3);
    assert_eq!(losses[1], LOSS_PENALTY);
    for loss in [losses[0], losses[2]] {
        assert!(loss.is_finite());
        assert!(loss >= 0.0);
        assert!(loss < LOSS_PENALTY);
    }
}

#[test]
fn accuracy_batch_uses_placeholder_for_empty_completion() {
    let generator = Arc::new(ScriptedGenerator::new("", "no").with_judge(|prompt: &str| {
        if prompt.contains(EMPTY_COMPLETION_FALLBACK) {
            "yes".to_string()
        } else {
            "no".to_string()
        }
    }));
    let loader = MockModelLoader::new().with_generator(generator.clone());
    let service = service(loader);

    let result = service.score(&batch(
        vec![Criterion::Accuracy],
        vec![submission(3, HIDDEN, 0.0), submission(1, HIDDEN, 5.0)],
    ));

    assert_eq!(result.get(Criterion::Accuracy), Some(&[1.0, 1.0][..]));
    let prompts = generator.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts.iter().all(|p| p.contains(EMPTY_COMPLETION_FALLBACK)));
}

#[test]
fn uniform_selection_reports_exactly_one_criterion() {
    let generator = Arc::new(ScriptedGenerator::new("Paris", "yes"));
    let service = service(MockModelLoader::new().with_generator(generator));
    let request = batch(
        vec![Criterion::Likelihood, Criterion::Accuracy],
        vec![submission(2, HIDDEN, 0.0)],
    );

    for _ in 0..8 {
        let result = service.score(&request);
        assert_eq!(result.metrics.len(), 1);
        let (criterion, scores) = result.metrics.iter().next().unwrap();
        assert_eq!(scores.len(), 1);
        if *criterion == Criterion::Accuracy {
            assert_eq!(scores[0], 1.0);
        }
    }
}

#[test]
fn model_is_loaded_once_across_batches() {
    let loader = Arc::new(MockModelLoader::new());
    let registry = Arc::new(ModelRegistry::new(loader.clone(), Device::Cpu));
    let service = ScoringService::new(registry, ScoringSettings::default())
        .with_selector(Box::new(FixedSelector(Criterion::Likelihood)));
    let request = batch(vec![Criterion::Likelihood], vec![submission(1, HIDDEN, 0.0)]);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let result = service.score(&request);
                assert_eq!(result.get(Criterion::Likelihood).map(<[f64]>::len), Some(1));
            });
        }
    });

    assert_eq!(loader.load_count(), 1);
}

#[test]
fn load_failure_yields_empty_metrics_then_recovers() {
    let service = service(MockModelLoader::new().failing_times(1));
    let request = batch(vec![Criterion::Likelihood], vec![submission(1, HIDDEN, 0.0)]);

    assert_eq!(service.score(&request), ScoringResult::empty());
    assert_eq!(
        service.score(&request).get(Criterion::Likelihood).map(<[f64]>::len),
        Some(1)
    );
}

#[test]
fn pretrained_checkpoint_scores_both_criteria() {
    let root = tempfile::tempdir().unwrap();
    write_fixture_checkpoint(&root.path().join("dummy-model"), HIDDEN).unwrap();
    let loader = PretrainedLoader::new(Some(root.path().to_path_buf()), DType::F32);
    let registry = Arc::new(ModelRegistry::new(Arc::new(loader), Device::Cpu));
    let submissions = vec![
        submission(2, HIDDEN, 0.0),
        submission(2, HIDDEN * 2, 1.0),
        submission(3, HIDDEN, 2.0),
    ];

    let likelihood = ScoringService::new(registry.clone(), ScoringSettings::default())
        .with_selector(Box::new(FixedSelector(Criterion::Likelihood)));
    let result = likelihood.score(&batch(vec![Criterion::Likelihood], submissions.clone()));
    let losses = result.get(Criterion::Likelihood).unwrap();
    assert_eq!(losses.len(), 3);
    assert_eq!(losses[1], LOSS_PENALTY);
    assert!(losses[0].is_finite() && losses[0] >= 0.0 && losses[0] < LOSS_PENALTY);
    assert!(losses[2].is_finite() && losses[2] >= 0.0 && losses[2] < LOSS_PENALTY);

    let accuracy = ScoringService::new(
        registry,
        ScoringSettings {
            max_new_tokens: 4,
            judge_max_new_tokens: 4,
        },
    )
    .with_selector(Box::new(FixedSelector(Criterion::Accuracy)));
    let result = accuracy.score(&batch(vec![Criterion::Accuracy], submissions));
    let scores = result.get(Criterion::Accuracy).unwrap();
    assert_eq!(scores.len(), 3);
    assert_eq!(scores[1], 0.0);
    assert!(scores.iter().all(|s| *s == 0.0 || *s == 1.0));
}
