//! Seams between the scoring engine and the model runtime.
//!
//! The registry hands out these as trait objects so evaluators can be driven by the
//! candle-backed implementations in production and by scripted doubles in tests.

use candle_core::{DType, Device, Tensor};

use super::error::ModelError;

/// Causal language model addressed through input embeddings.
pub trait CausalModel: Send + Sync {
    /// Width of the embedding table (and of every accepted input vector).
    fn hidden_size(&self) -> usize;

    fn vocab_size(&self) -> usize;

    /// Working precision of embeddings and activations.
    fn dtype(&self) -> DType;

    fn device(&self) -> &Device;

    /// Longest sequence a single forward pass accepts.
    fn max_positions(&self) -> usize;

    /// Looks up `ids` in the embedding table, returning `[1, ids.len(), hidden]`.
    fn embed_tokens(&self, ids: &[u32]) -> Result<Tensor, ModelError>;

    /// Runs a full forward pass over `[1, seq, hidden]` embeddings and returns
    /// `[1, seq, vocab]` next-token logits.
    fn forward_embeds(&self, inputs_embeds: &Tensor) -> Result<Tensor, ModelError>;
}

/// Text <-> token id conversion.
pub trait TokenCodec: Send + Sync {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, ModelError>;

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, ModelError>;

    fn token_to_id(&self, token: &str) -> Option<u32>;
}

impl TokenCodec for tokenizers::Tokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, ModelError> {
        (**self)
            .encode(text, add_special_tokens)
            .map(|encoding| encoding.get_ids().to_vec())
            .map_err(|e| ModelError::TokenizationFailed {
                reason: e.to_string(),
            })
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, ModelError> {
        (**self)
            .decode(ids, skip_special_tokens)
            .map_err(|e| ModelError::TokenizationFailed {
                reason: e.to_string(),
            })
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        (**self).token_to_id(token)
    }
}

/// Generation adapter bound to one loaded model.
pub trait TextGenerator: Send + Sync {
    /// Continues `[1, seq, hidden]` input embeddings and returns the decoded new text,
    /// special tokens removed and surrounding whitespace trimmed.
    fn complete_embeddings(
        &self,
        inputs_embeds: &Tensor,
        max_new_tokens: usize,
    ) -> Result<String, ModelError>;

    /// Sends `prompt` as a single user turn and returns only the newly generated text.
    fn chat(&self, prompt: &str, max_new_tokens: usize) -> Result<String, ModelError>;
}
