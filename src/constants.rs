//! Cross-cutting, shared constants.
//!
//! Wire-visible values (sentinels, placeholder text, criterion names) live here so the
//! evaluators, the gateway and the tests agree on them.

/// Score recorded for a submission that could not be evaluated under the likelihood criterion.
pub const LOSS_PENALTY: f64 = 1000.0;

/// Score recorded for a submission that could not be evaluated under the accuracy criterion.
pub const ACCURACY_PENALTY: f64 = 0.0;

/// Label value excluded from the cross-entropy average.
pub const IGNORE_INDEX: i64 = -100;

/// New-token budget when continuing a compressed context.
pub const DEFAULT_MAX_NEW_TOKENS: usize = 64;

/// New-token budget for the judge's verdict.
pub const DEFAULT_JUDGE_MAX_NEW_TOKENS: usize = 32;

/// Completion substituted when generation decodes to empty text.
pub const EMPTY_COMPLETION_FALLBACK: &str = "I dont know";

/// Literal control tokens removed from the judge prompt before templating.
pub const JUDGE_STRIPPED_TOKENS: &[&str] = &["</s>", "[/INST]"];

/// Substring whose presence in the judge output means "correct".
pub const JUDGE_AFFIRMATIVE: &str = "yes";

/// Upper bound on precomputed rotary positions, regardless of model config.
pub const MAX_ROPE_POSITIONS: usize = 32_768;

/// Default cap for remotely fetched `.npy` arrays, in megabytes.
pub const DEFAULT_MAX_DOWNLOAD_MB: u64 = 1024;

/// Liveness message returned by `GET /`.
pub const LIVENESS_MESSAGE: &str = "I'm alive!";
