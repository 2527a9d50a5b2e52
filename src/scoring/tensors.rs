//! Input construction shared by the evaluators.
//!
//! Both criteria feed the model `[compressed | activation prompt]` embeddings; the
//! likelihood criterion appends the expected completion and a label sequence aligned
//! with that concatenation.

use candle_core::Tensor;

use crate::constants::IGNORE_INDEX;
use crate::model::{CausalModel, TokenCodec};
use crate::payload::CompressedTokens;

use super::error::ScoringError;
use super::types::GroundTruthSpec;

/// Tokenized and embedded ground-truth text, computed once per batch.
#[derive(Debug, Clone)]
pub struct GroundTruthTensors {
    pub prompt_ids: Vec<u32>,
    pub prompt_embeds: Tensor,
    pub completion_ids: Vec<u32>,
    pub completion_embeds: Tensor,
}

impl GroundTruthTensors {
    /// Tokenizes prompt and completion without special tokens and embeds them at the
    /// model's working precision.
    pub fn prepare(
        model: &dyn CausalModel,
        tokenizer: &dyn TokenCodec,
        ground_truth: &GroundTruthSpec,
    ) -> Result<Self, ScoringError> {
        let prompt_ids = tokenizer.encode(&ground_truth.activation_prompt, false)?;
        let completion_ids = tokenizer.encode(&ground_truth.expected_completion, false)?;

        let prompt_embeds = embed_ids(model, &prompt_ids)?;
        let completion_embeds = embed_ids(model, &completion_ids)?;

        Ok(Self {
            prompt_ids,
            prompt_embeds,
            completion_ids,
            completion_embeds,
        })
    }
}

fn embed_ids(model: &dyn CausalModel, ids: &[u32]) -> Result<Tensor, ScoringError> {
    if ids.is_empty() {
        return Ok(Tensor::zeros(
            (1, 0, model.hidden_size()),
            model.dtype(),
            model.device(),
        )?);
    }
    Ok(model.embed_tokens(ids)?.to_dtype(model.dtype())?)
}

/// `[1, seq_len, hidden]` tensor of the compressed tokens at the model's precision.
///
/// Fails if the hidden width differs from the model's embedding width.
pub fn compressed_embeddings(
    model: &dyn CausalModel,
    tokens: &CompressedTokens,
) -> Result<Tensor, ScoringError> {
    if tokens.hidden_size() != model.hidden_size() {
        return Err(ScoringError::HiddenSizeMismatch {
            expected: model.hidden_size(),
            actual: tokens.hidden_size(),
        });
    }

    let tensor = Tensor::from_slice(
        tokens.as_slice(),
        (1, tokens.seq_len(), tokens.hidden_size()),
        model.device(),
    )?;
    Ok(tensor.to_dtype(model.dtype())?)
}

/// Concatenates `[1, n, hidden]` pieces along the sequence axis, skipping empty ones.
pub fn concat_sequence(parts: &[&Tensor]) -> Result<Tensor, ScoringError> {
    let non_empty: Vec<&Tensor> = parts
        .iter()
        .copied()
        .filter(|t| t.dims().get(1).is_some_and(|&len| len > 0))
        .collect();

    match non_empty.as_slice() {
        [] => Err(ScoringError::NoTargetTokens),
        [single] => Ok((*single).clone()),
        many => Ok(Tensor::cat(many, 1)?),
    }
}

/// Labels for `[compressed | prompt | completion]`: the ignore index under the compressed
/// span, token ids under both text spans.
pub fn build_labels(compressed_len: usize, prompt_ids: &[u32], completion_ids: &[u32]) -> Vec<i64> {
    let mut labels = Vec::with_capacity(compressed_len + prompt_ids.len() + completion_ids.len());
    labels.extend(std::iter::repeat_n(IGNORE_INDEX, compressed_len));
    labels.extend(prompt_ids.iter().map(|&id| i64::from(id)));
    labels.extend(completion_ids.iter().map(|&id| i64::from(id)));
    labels
}

/// Drops the first label so position `i` holds the target for logits at position `i`.
pub fn shift_labels(labels: &[i64]) -> &[i64] {
    labels.get(1..).unwrap_or(&[])
}

/// Embeddings and labels for one submission under the likelihood criterion.
pub fn likelihood_inputs(
    model: &dyn CausalModel,
    tokens: &CompressedTokens,
    ground_truth: &GroundTruthTensors,
) -> Result<(Tensor, Vec<i64>), ScoringError> {
    let compressed = compressed_embeddings(model, tokens)?;
    let embeds = concat_sequence(&[
        &compressed,
        &ground_truth.prompt_embeds,
        &ground_truth.completion_embeds,
    ])?;
    let labels = build_labels(
        tokens.seq_len(),
        &ground_truth.prompt_ids,
        &ground_truth.completion_ids,
    );
    Ok((embeds, labels))
}

/// Embeddings for one submission under the accuracy criterion.
pub fn generation_inputs(
    model: &dyn CausalModel,
    tokens: &CompressedTokens,
    ground_truth: &GroundTruthTensors,
) -> Result<Tensor, ScoringError> {
    let compressed = compressed_embeddings(model, tokens)?;
    concat_sequence(&[&compressed, &ground_truth.prompt_embeds])
}
