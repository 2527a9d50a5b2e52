use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constants::{ACCURACY_PENALTY, LOSS_PENALTY};
use crate::payload::{CompressedTokens, PayloadError, decode_compressed_tokens};

/// Scoring algorithm applied to a whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Criterion {
    /// Token-averaged cross-entropy of the expected completion. Lower is better.
    #[serde(rename = "loss", alias = "likelihood")]
    Likelihood,
    /// Generated completion judged correct (1) or not (0).
    #[serde(rename = "accuracy", alias = "generation")]
    Accuracy,
}

impl Criterion {
    /// Wire name used as the metrics key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Criterion::Likelihood => "loss",
            Criterion::Accuracy => "accuracy",
        }
    }

    /// Score recorded for a submission that could not be evaluated.
    pub fn penalty(&self) -> f64 {
        match self {
            Criterion::Likelihood => LOSS_PENALTY,
            Criterion::Accuracy => ACCURACY_PENALTY,
        }
    }
}

impl std::fmt::Display for Criterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference example every submission in a batch is scored against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthSpec {
    pub model_name: String,
    #[serde(rename = "criterias")]
    pub criteria: Vec<Criterion>,
    pub activation_prompt: String,
    pub expected_completion: String,
}

/// One miner's compressed context as received on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerSubmission {
    pub compressed_tokens_b64: String,
}

impl MinerSubmission {
    pub fn new(compressed_tokens_b64: impl Into<String>) -> Self {
        Self {
            compressed_tokens_b64: compressed_tokens_b64.into(),
        }
    }

    pub fn from_tokens(tokens: &CompressedTokens) -> Self {
        Self::new(crate::payload::encode_compressed_tokens(tokens))
    }

    /// Decodes the payload without consuming the submission.
    pub fn decode(&self) -> Result<CompressedTokens, PayloadError> {
        decode_compressed_tokens(&self.compressed_tokens_b64)
    }
}

/// Submission after payload decoding; a decode error is kept for per-submission scoring.
pub type DecodedSubmission = Result<CompressedTokens, PayloadError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchScoringRequest {
    pub ground_truth_request: GroundTruthSpec,
    pub miner_responses: Vec<MinerSubmission>,
}

/// Result of scoring one submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    Scored(f64),
    Failed { reason: String },
}

impl SubmissionOutcome {
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        SubmissionOutcome::Failed {
            reason: reason.to_string(),
        }
    }

    /// The score, or `penalty` if the submission failed.
    pub fn score_or(&self, penalty: f64) -> f64 {
        match self {
            SubmissionOutcome::Scored(value) => *value,
            SubmissionOutcome::Failed { .. } => penalty,
        }
    }

    pub fn is_scored(&self) -> bool {
        matches!(self, SubmissionOutcome::Scored(_))
    }
}

/// Per-criterion scores, positionally aligned with the submissions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoringResult {
    pub metrics: BTreeMap<Criterion, Vec<f64>>,
}

impl ScoringResult {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Projects `outcomes` to scores, substituting the criterion's penalty for failures.
    pub fn from_outcomes(criterion: Criterion, outcomes: &[SubmissionOutcome]) -> Self {
        let penalty = criterion.penalty();
        let scores = outcomes.iter().map(|o| o.score_or(penalty)).collect();
        Self::single(criterion, scores)
    }

    pub fn single(criterion: Criterion, scores: Vec<f64>) -> Self {
        let mut metrics = BTreeMap::new();
        metrics.insert(criterion, scores);
        Self { metrics }
    }

    pub fn get(&self, criterion: Criterion) -> Option<&[f64]> {
        self.metrics.get(&criterion).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
