use candle_core::{DType, Device, IndexOp, Tensor};
use tracing::{debug, info, warn};

use crate::constants::IGNORE_INDEX;
use crate::model::CausalModel;
use crate::payload::CompressedTokens;
use crate::registry::CachedModel;

use super::error::ScoringError;
use super::evaluator::CriterionEvaluator;
use super::tensors::{GroundTruthTensors, likelihood_inputs, shift_labels};
use super::types::{Criterion, DecodedSubmission, GroundTruthSpec, SubmissionOutcome};

/// Cross-entropy of the ground-truth text given the compressed context.
#[derive(Debug, Clone, Copy, Default)]
pub struct LikelihoodEvaluator;

impl LikelihoodEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn score_one(
        &self,
        model: &dyn CausalModel,
        tokens: &CompressedTokens,
        ground_truth: &GroundTruthTensors,
    ) -> Result<f64, ScoringError> {
        let (embeds, labels) = likelihood_inputs(model, tokens, ground_truth)?;
        let logits = model.forward_embeds(&embeds)?;
        token_cross_entropy(&logits, shift_labels(&labels))
    }
}

impl CriterionEvaluator for LikelihoodEvaluator {
    fn criterion(&self) -> Criterion {
        Criterion::Likelihood
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
                    Ok(tokens) => self.score_one(model.model.as_ref(), tokens, &prepared),
                    Err(e) => Err(ScoringError::InvalidSubmission {
                        reason: e.to_string(),
                    }),
                };
                match result {
                    Ok(loss) => {
                        debug!(index, loss, "Submission scored");
                        SubmissionOutcome::Scored(loss)
                    }
                    Err(e) => {
                        warn!(index, error = %e, "Submission failed likelihood scoring");
                        SubmissionOutcome::failed(e)
                    }
                }
            })
            .collect();

        info!(
            submissions = outcomes.len(),
            failed = outcomes.iter().filter(|o| !o.is_scored()).count(),
            "Likelihood criterion evaluated"
        );
        Ok(outcomes)
    }
}

/// Mean cross-entropy of `logits[:, :-1]` against `shifted_labels`, ignoring
/// [`IGNORE_INDEX`] positions.
///
/// `logits` is `[1, seq, vocab]` and `shifted_labels` has `seq - 1` entries.
pub fn token_cross_entropy(logits: &Tensor, shifted_labels: &[i64]) -> Result<f64, ScoringError> {
    let (_batch, seq_len, vocab_size) = logits.dims3()?;
    if shifted_labels.len() + 1 != seq_len {
        return Err(ScoringError::InvalidLabels {
            reason: format!(
                "{} labels for {} logit positions",
                shifted_labels.len(),
                seq_len
            ),
        });
    }

    let mut positions = Vec::with_capacity(shifted_labels.len());
    let mut targets = Vec::with_capacity(shifted_labels.len());
    for (position, &label) in shifted_labels.iter().enumerate() {
        if label == IGNORE_INDEX {
            continue;
        }
        let target = u32::try_from(label)
            .ok()
            .filter(|&t| (t as usize) < vocab_size)
            .ok_or_else(|| ScoringError::InvalidLabels {
                reason: format!("label {} outside vocabulary of {}", label, vocab_size),
            })?;
        positions.push(position as u32);
        targets.push(target);
    }

    if positions.is_empty() {
        return Err(ScoringError::NoTargetTokens);
    }

    let device: &Device = logits.device();
    let positions = Tensor::new(positions.as_slice(), device)?;
    let targets = Tensor::new(targets.as_slice(), device)?;

    let selected = logits
        .i(0)?
        .index_select(&positions, 0)?
        .to_dtype(DType::F32)?;
    let loss = candle_nn::loss::cross_entropy(&selected, &targets)?
        .to_scalar::<f32>()? as f64;

    if !loss.is_finite() {
        return Err(ScoringError::NonFiniteLoss { value: loss });
    }
    Ok(loss)
}
