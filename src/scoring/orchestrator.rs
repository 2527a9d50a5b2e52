use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::constants::{DEFAULT_JUDGE_MAX_NEW_TOKENS, DEFAULT_MAX_NEW_TOKENS};
use crate::model::reclaim_device_memory;
use crate::registry::ModelRegistry;

use super::accuracy::AccuracyEvaluator;
use super::error::ScoringError;
use super::evaluator::CriterionEvaluator;
use super::judge::Judge;
use super::likelihood::LikelihoodEvaluator;
use super::selector::{CriterionSelector, UniformSelector};
use super::types::{BatchScoringRequest, Criterion, DecodedSubmission, ScoringResult};

/// Generation budgets for the accuracy criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringSettings {
    pub max_new_tokens: usize,
    pub judge_max_new_tokens: usize,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            judge_max_new_tokens: DEFAULT_JUDGE_MAX_NEW_TOKENS,
        }
    }
}

/// Scores batches of miner submissions.
///
/// [`score`](Self::score) never fails: anything that prevents scoring is logged and
/// reported as an empty [`ScoringResult`].
pub struct ScoringService {
    registry: Arc<ModelRegistry>,
    selector: Box<dyn CriterionSelector>,
    likelihood: LikelihoodEvaluator,
    accuracy: AccuracyEvaluator,
}

impl std::fmt::Debug for ScoringService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoringService")
            .field("accuracy", &self.accuracy)
            .finish_non_exhaustive()
    }
}

impl ScoringService {
    pub fn new(registry: Arc<ModelRegistry>, settings: ScoringSettings) -> Self {
        Self {
            registry,
            selector: Box::new(UniformSelector),
            likelihood: LikelihoodEvaluator::new(),
            accuracy: AccuracyEvaluator::new(
                settings.max_new_tokens,
                Judge::new(settings.judge_max_new_tokens),
            ),
        }
    }

    /// Replaces the default uniform criterion selection.
    pub fn with_selector(mut self, selector: Box<dyn CriterionSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    #[instrument(
        skip_all,
        fields(
            batch_id = %Uuid::new_v4(),
            model = %request.ground_truth_request.model_name,
            submissions = request.miner_responses.len()
        )
    )]
    pub fn score(&self, request: &BatchScoringRequest) -> ScoringResult {
        let started = Instant::now();
        let result = match self.try_score(request) {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Batch scoring failed");
                ScoringResult::empty()
            }
        };

        reclaim_device_memory(self.registry.device());
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            criteria = ?result.metrics.keys().collect::<Vec<_>>(),
            "Batch scored"
        );
        result
    }

    fn try_score(&self, request: &BatchScoringRequest) -> Result<ScoringResult, ScoringError> {
        let ground_truth = &request.ground_truth_request;
        let model = self.registry.ensure_ready(&ground_truth.model_name)?;

        let submissions: Vec<DecodedSubmission> = request
            .miner_responses
            .iter()
            .map(|submission| submission.decode())
            .collect();

        let criterion = self
            .selector
            .select(&ground_truth.criteria)
            .ok_or(ScoringError::NoCriteria)?;
        info!(%criterion, "Criterion selected");

        let evaluator = self.evaluator(criterion);
        match evaluator.evaluate(&model, ground_truth, &submissions) {
            Ok(outcomes) => Ok(ScoringResult::from_outcomes(criterion, &outcomes)),
            Err(e) => {
                error!(%criterion, error = %e, "Criterion evaluation failed");
                Ok(ScoringResult::single(criterion, Vec::new()))
            }
        }
    }

    fn evaluator(&self, criterion: Criterion) -> &dyn CriterionEvaluator {
        match criterion {
            Criterion::Likelihood => &self.likelihood,
            Criterion::Accuracy => &self.accuracy,
        }
    }
}
