//! Yes/no correctness verdicts produced by the scored model itself.

use tracing::{info, warn};

use crate::constants::{DEFAULT_JUDGE_MAX_NEW_TOKENS, JUDGE_AFFIRMATIVE, JUDGE_STRIPPED_TOKENS};
use crate::model::TextGenerator;

/// Leading whitespace of each line after the first in the judge instruction.
const JUDGE_INDENT: &str = "            ";

/// Renders the judge instruction for one pair of completions, with control tokens removed.
pub fn judge_prompt(expected: &str, completion: &str) -> String {
    let prompt = format!(
        "Task description: Given a ground truth completion and a model completion, answer \
         concisely: yes if the model completion is correct, and no otherwise. \n{JUDGE_INDENT}\
         - Ground truth completion: {expected}\n{JUDGE_INDENT}\
         - Model completion: {completion}\n{JUDGE_INDENT}"
    );
    JUDGE_STRIPPED_TOKENS
        .iter()
        .fold(prompt, |acc, token| acc.replace(token, ""))
}

#[derive(Debug, Clone, Copy)]
pub struct Judge {
    max_new_tokens: usize,
}

impl Default for Judge {
    fn default() -> Self {
        Self::new(DEFAULT_JUDGE_MAX_NEW_TOKENS)
    }
}

impl Judge {
    pub fn new(max_new_tokens: usize) -> Self {
        Self { max_new_tokens }
    }

    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }

    /// Returns `true` if the generator's answer contains "yes" (case-sensitive).
    ///
    /// Generation failures count as a negative verdict.
    pub fn verdict(&self, generator: &dyn TextGenerator, expected: &str, completion: &str) -> bool {
        let prompt = judge_prompt(expected, completion);
        match generator.chat(&prompt, self.max_new_tokens) {
            Ok(answer) => {
                let correct = answer.contains(JUDGE_AFFIRMATIVE);
                info!(expected, completion, answer = %answer, correct, "Judge verdict");
                correct
            }
            Err(e) => {
                warn!(error = %e, "Judge generation failed");
                false
            }
        }
    }
}
