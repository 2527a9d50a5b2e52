use std::sync::Arc;

use candle_core::{DType, IndexOp, Tensor};
use candle_transformers::generation::LogitsProcessor;
use tracing::debug;

use super::chat::ChatTemplate;
use super::decoder::CausalDecoder;
use super::error::ModelError;
use super::traits::{CausalModel, TextGenerator, TokenCodec};

/// Greedy decoding seed; unused by argmax sampling but required by the processor.
const GENERATION_SEED: u64 = 299_792_458;

/// Greedily extends `inputs_embeds` by up to `max_new_tokens` tokens.
///
/// Returns only the new token ids; a token listed in `stop_ids` ends generation and is
/// not included.
pub fn generate_tokens(
    model: &CausalDecoder,
    inputs_embeds: &Tensor,
    max_new_tokens: usize,
    stop_ids: &[u32],
) -> Result<Vec<u32>, ModelError> {
    let (_batch, prompt_len, _hidden) = inputs_embeds.dims3()?;
    if prompt_len == 0 {
        return Err(ModelError::GenerationFailed {
            reason: "empty prompt".to_string(),
        });
    }
    model.check_positions(prompt_len + max_new_tokens)?;

    let mut processor = LogitsProcessor::new(GENERATION_SEED, None, None);
    let mut cache = model.new_cache();
    let inputs_embeds = inputs_embeds.to_dtype(CausalModel::dtype(model))?;

    let mut logits = model.forward_with_cache(&inputs_embeds, 0, &mut cache)?;
    let mut offset = prompt_len;
    let mut generated = Vec::with_capacity(max_new_tokens);

    for _ in 0..max_new_tokens {
        let last = logits.dim(1)? - 1;
        let next_logits = logits.i((0, last))?.to_dtype(DType::F32)?;
        let next = processor.sample(&next_logits)?;
        if stop_ids.contains(&next) {
            break;
        }
        generated.push(next);

        let step = CausalModel::embed_tokens(model, &[next])?;
        logits = model.forward_with_cache(&step, offset, &mut cache)?;
        offset += 1;
    }

    debug!(
        prompt_len,
        generated = generated.len(),
        "Generation finished"
    );

    Ok(generated)
}

/// Generation adapter over a [`CausalDecoder`] and its tokenizer.
pub struct DecoderGenerator {
    model: Arc<CausalDecoder>,
    tokenizer: Arc<dyn TokenCodec>,
    template: ChatTemplate,
    stop_ids: Vec<u32>,
}

impl std::fmt::Debug for DecoderGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderGenerator")
            .field("model", &self.model)
            .field("template", &self.template)
            .field("stop_ids", &self.stop_ids)
            .finish()
    }
}

impl DecoderGenerator {
    pub fn new(model: Arc<CausalDecoder>, tokenizer: Arc<dyn TokenCodec>) -> Self {
        let template = ChatTemplate::detect(tokenizer.as_ref());
        let mut stop_ids = model.config().eos_token_ids();
        for id in template.stop_token_ids(tokenizer.as_ref()) {
            if !stop_ids.contains(&id) {
                stop_ids.push(id);
            }
        }

        Self {
            model,
            tokenizer,
            template,
            stop_ids,
        }
    }

    pub fn template(&self) -> ChatTemplate {
        self.template
    }

    pub fn stop_ids(&self) -> &[u32] {
        &self.stop_ids
    }
}

impl TextGenerator for DecoderGenerator {
    fn complete_embeddings(
        &self,
        inputs_embeds: &Tensor,
        max_new_tokens: usize,
    ) -> Result<String, ModelError> {
        let ids = generate_tokens(&self.model, inputs_embeds, max_new_tokens, &self.stop_ids)?;
        let text = self.tokenizer.decode(&ids, true)?;
        Ok(text.trim().to_string())
    }

    fn chat(&self, prompt: &str, max_new_tokens: usize) -> Result<String, ModelError> {
        let rendered = self.template.render_user(prompt);
        let ids = self.tokenizer.encode(&rendered, false)?;
        if ids.is_empty() {
            return Err(ModelError::GenerationFailed {
                reason: "chat prompt encoded to zero tokens".to_string(),
            });
        }

        let embeds = CausalModel::embed_tokens(self.model.as_ref(), &ids)?;
        let generated = generate_tokens(&self.model, &embeds, max_new_tokens, &self.stop_ids)?;
        self.tokenizer.decode(&generated, true)
    }
}
