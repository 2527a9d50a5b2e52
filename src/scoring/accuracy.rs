use tracing::{debug, info, warn};

use crate::constants::{DEFAULT_MAX_NEW_TOKENS, EMPTY_COMPLETION_FALLBACK};
use crate::payload::CompressedTokens;
use crate::registry::CachedModel;

use super::error::ScoringError;
use super::evaluator::CriterionEvaluator;
use super::judge::Judge;
use super::tensors::{GroundTruthTensors, generation_inputs};
use super::types::{Criterion, DecodedSubmission, GroundTruthSpec, SubmissionOutcome};

/// Generates a continuation of the compressed context and asks the [`Judge`] whether it
/// matches the expected completion.
#[derive(Debug, Clone, Copy)]
pub struct AccuracyEvaluator {
    max_new_tokens: usize,
    judge: Judge,
}

impl Default for AccuracyEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_NEW_TOKENS, Judge::default())
    }
}

impl AccuracyEvaluator {
    pub fn new(max_new_tokens: usize, judge: Judge) -> Self {
        Self {
            max_new_tokens,
            judge,
        }
    }

    /// Generated completion for one submission, or the placeholder when it is empty.
    pub fn complete(
        &self,
        model: &CachedModel,
        tokens: &CompressedTokens,
        ground_truth: &GroundTruthTensors,
    ) -> Result<String, ScoringError> {
        let embeds = generation_inputs(model.model.as_ref(), tokens, ground_truth)?;
        let completion = model
            .generator
            .complete_embeddings(&embeds, self.max_new_tokens)?;
        let completion = completion.trim();

        if completion.is_empty() {
            return Ok(EMPTY_COMPLETION_FALLBACK.to_string());
        }
        Ok(completion.to_string())
    }

    fn score_one(
        &self,
        model: &CachedModel,
        tokens: &CompressedTokens,
        ground_truth: &GroundTruthTensors,
        expected: &str,
    ) -> Result<f64, ScoringError> {
        let completion = self.complete(model, tokens, ground_truth)?;
        let correct = self
            .judge
            .verdict(model.generator.as_ref(), expected, &completion);
        Ok(if correct { 1.0 } else { 0.0 })
    }
}

impl CriterionEvaluator for AccuracyEvaluator {
    fn criterion(&self) -> Criterion {
        Criterion::Accuracy
    }

    fn evaluate(
        &self,
        model: &CachedModel,
        ground_truth: &GroundTruthSpec,
        submissions: &[DecodedSubmission],
    ) -> Result<Vec<SubmissionOutcome>, ScoringError> {
        let prepared =
            GroundTruthTensors::prepare(model.model.as_ref(), model.tokenizer.as_ref(), ground_truth)?;

        let outcomes: Vec<SubmissionOutcome> = submissions
            .iter()
            .enumerate()
            .map(|(index, submission)| {
                let result = match submission {
                    Ok(tokens) => self.score_one(
                        model,
                        tokens,
                        &prepared,
                        &ground_truth.expected_completion,
                    ),
                    Err(e) => Err(ScoringError::InvalidSubmission {
                        reason: e.to_string(),
                    }),
                };
                match result {
                    Ok(score) => {
                        debug!(index, score, "Submission judged");
                        SubmissionOutcome::Scored(score)
                    }
                    Err(e) => {
                        warn!(index, error = %e, "Submission failed accuracy scoring");
                        SubmissionOutcome::failed(e)
                    }
                }
            })
            .collect();

        info!(
            submissions = outcomes.len(),
            correct = outcomes.iter().filter(|o| o.score_or(0.0) > 0.0).count(),
            "Accuracy criterion evaluated"
        );
        Ok(outcomes)
    }
}
