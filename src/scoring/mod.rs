//! Batch scoring of compressed contexts.
//!
//! A batch is one [`GroundTruthSpec`] plus an ordered list of miner submissions. The
//! [`ScoringService`] loads the target model through the registry, decodes every
//! submission, picks one [`Criterion`] from the allowed set and runs its evaluator:
//!
//! - [`Criterion::Likelihood`] (`"loss"`): cross-entropy of the activation prompt and
//!   expected completion given the compressed tokens. Failures score 1000.
//! - [`Criterion::Accuracy`] (`"accuracy"`): greedy generation from the compressed tokens
//!   and activation prompt, judged against the expected completion by the same model.
//!   Failures score 0.
//!
//! Scores stay positionally aligned with the submissions. A criterion that cannot run
//! at all reports an empty score list; a batch that cannot run reports no metrics.

pub mod accuracy;
pub mod error;
pub mod evaluator;
pub mod judge;
pub mod likelihood;
pub mod orchestrator;
pub mod selector;
pub mod tensors;
pub mod types;

#[cfg(test)]
mod tests;

pub use accuracy::AccuracyEvaluator;
pub use error::ScoringError;
pub use evaluator::CriterionEvaluator;
pub use judge::{Judge, judge_prompt};
pub use likelihood::{LikelihoodEvaluator, token_cross_entropy};
pub use orchestrator::{ScoringService, ScoringSettings};
pub use selector::{CriterionSelector, FixedSelector, UniformSelector};
pub use types::{
    BatchScoringRequest, Criterion, DecodedSubmission, GroundTruthSpec, MinerSubmission,
    ScoringResult, SubmissionOutcome,
};
