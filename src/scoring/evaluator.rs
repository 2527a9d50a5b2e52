use crate::registry::CachedModel;

use super::error::ScoringError;
use super::types::{Criterion, DecodedSubmission, GroundTruthSpec, SubmissionOutcome};

/// Scores every submission of a batch under one criterion.
///
/// `Err` means the criterion as a whole could not run (for example the ground truth
/// failed to tokenize); per-submission problems are reported as
/// [`SubmissionOutcome::Failed`] and never abort the batch.
pub trait CriterionEvaluator: Send + Sync {
    fn criterion(&self) -> Criterion;

    fn evaluate(
        &self,
        model: &CachedModel,
        ground_truth: &GroundTruthSpec,
        submissions: &[DecodedSubmission],
    ) -> Result<Vec<SubmissionOutcome>, ScoringError>;
}
