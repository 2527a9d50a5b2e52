//! Decoder-only causal language model (Llama / Mistral / Qwen2 family).
//!
//! Unlike the stock candle-transformers models, the forward pass starts from input
//! embeddings instead of token ids so callers can splice arbitrary embedding-space
//! vectors in front of real tokens. Attention state lives in a caller-owned
//! [`DecoderCache`], which keeps the model itself immutable and shareable.

use std::path::PathBuf;

use candle_core::{D, DType, Device, Module, Result, Tensor};
use candle_nn::{Embedding, Linear, RmsNorm, VarBuilder};

use super::config::DecoderConfig;
use super::error::ModelError;
use super::traits::CausalModel;
use crate::constants::MAX_ROPE_POSITIONS;

/// Precomputed rotary position embeddings.
pub(crate) struct RotaryEmbedding {
    pub(crate) cos: Tensor,
    pub(crate) sin: Tensor,
}

impl RotaryEmbedding {
    pub(crate) fn new(
        config: &DecoderConfig,
        max_positions: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let inv_freq = config.rope_inv_freq();
        let inv_freq = Tensor::new(inv_freq, device)?;
        let positions: Vec<f32> = (0..max_positions).map(|p| p as f32).collect();
        let positions = Tensor::new(positions, device)?;

        // [max_positions] x [half_dim] -> [max_positions, half_dim]
        let freqs = positions.unsqueeze(1)?.matmul(&inv_freq.unsqueeze(0)?)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;

        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    pub(crate) fn apply(&self, x: &Tensor, seq_start: usize) -> Result<Tensor> {
        let (_batch, _heads, seq_len, head_dim) = x.dims4()?;

        let cos = self.cos.narrow(0, seq_start, seq_len)?;
        let sin = self.sin.narrow(0, seq_start, seq_len)?;

        // [1, 1, seq_len, head_dim]
        let cos = cos.unsqueeze(0)?.unsqueeze(0)?;
        let sin = sin.unsqueeze(0)?.unsqueeze(0)?;

        let half = head_dim / 2;
        let x1 = x.narrow(D::Minus1, 0, half)?;
        let x2 = x.narrow(D::Minus1, half, half)?;
        let x_rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;

        x.broadcast_mul(&cos)? + x_rotated.broadcast_mul(&sin)?
    }
}

/// Per-call key/value cache, one slot per layer.
pub struct DecoderCache {
    layers: Vec<Option<(Tensor, Tensor)>>,
}

impl DecoderCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: vec![None; num_layers],
        }
    }

    /// Number of positions already held by the cache.
    pub fn seq_len(&self) -> usize {
        self.layers
            .first()
            .and_then(|slot| slot.as_ref())
            .and_then(|(k, _)| k.dim(2).ok())
            .unwrap_or(0)
    }
}

struct DecoderLayer {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    input_norm: RmsNorm,
    post_attention_norm: RmsNorm,
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &DecoderConfig, attention_bias: bool) -> Result<Self> {
        let hidden = config.hidden_size;
        let head_dim = config.head_dim();
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_kv_heads();

        let attn = vb.pp("self_attn");
        let q_proj = candle_nn::linear_b(hidden, num_heads * head_dim, attention_bias, attn.pp("q_proj"))?;
        let k_proj =
            candle_nn::linear_b(hidden, num_kv_heads * head_dim, attention_bias, attn.pp("k_proj"))?;
        let v_proj =
            candle_nn::linear_b(hidden, num_kv_heads * head_dim, attention_bias, attn.pp("v_proj"))?;
        let o_proj = candle_nn::linear_no_bias(num_heads * head_dim, hidden, attn.pp("o_proj"))?;

        let mlp = vb.pp("mlp");
        let gate_proj =
            candle_nn::linear_no_bias(hidden, config.intermediate_size, mlp.pp("gate_proj"))?;
        let up_proj = candle_nn::linear_no_bias(hidden, config.intermediate_size, mlp.pp("up_proj"))?;
        let down_proj =
            candle_nn::linear_no_bias(config.intermediate_size, hidden, mlp.pp("down_proj"))?;

        let input_norm = candle_nn::rms_norm(hidden, config.rms_norm_eps, vb.pp("input_layernorm"))?;
        let post_attention_norm = candle_nn::rms_norm(
            hidden,
            config.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            input_norm,
            post_attention_norm,
            gate_proj,
            up_proj,
            down_proj,
            num_heads,
            num_kv_heads,
            head_dim,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        rope: &RotaryEmbedding,
        offset: usize,
        cache: &mut Option<(Tensor, Tensor)>,
    ) -> Result<Tensor> {
        let residual = x;
        let h = self.input_norm.forward(x)?;
        let h = self.self_attention(&h, mask, rope, offset, cache)?;
        let x = (residual + h)?;

        let residual = &x;
        let h = self.post_attention_norm.forward(&x)?;

        // SwiGLU: down(silu(gate(x)) * up(x))
        let gate = self.gate_proj.forward(&h)?;
        let up = self.up_proj.forward(&h)?;
        let h = (candle_nn::ops::silu(&gate)? * up)?;
        let h = self.down_proj.forward(&h)?;

        residual + h
    }

    fn self_attention(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        rope: &RotaryEmbedding,
        offset: usize,
        cache: &mut Option<(Tensor, Tensor)>,
    ) -> Result<Tensor> {
        let (batch, seq_len, _hidden) = x.dims3()?;
        let dtype = x.dtype();

        let q = self.q_proj.forward(x)?;
        let k = self.k_proj.forward(x)?;
        let v = self.v_proj.forward(x)?;

        // [batch, seq, heads * head_dim] -> [batch, heads, seq, head_dim]
        let q = q
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = rope.apply(&q, offset)?;
        let k = rope.apply(&k, offset)?;

        let (k, v) = match cache.take() {
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[&prev_k, &k], 2)?,
                Tensor::cat(&[&prev_v, &v], 2)?,
            ),
            None => (k, v),
        };
        *cache = Some((k.clone(), v.clone()));

        let k = self.repeat_kv(k)?.contiguous()?;
        let v = self.repeat_kv(v)?.contiguous()?;

        // Softmax runs in f32 regardless of the model dtype.
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn = (q.matmul(&k.t()?)? * scale)?.to_dtype(DType::F32)?;
        let attn = match mask {
            Some(mask) => attn.broadcast_add(mask)?,
            None => attn,
        };
        let attn = candle_nn::ops::softmax_last_dim(&attn)?.to_dtype(dtype)?;
        let out = attn.matmul(&v)?;

        // [batch, heads, seq, head_dim] -> [batch, seq, hidden]
        let out = out
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;

        self.o_proj.forward(&out)
    }

    fn repeat_kv(&self, x: Tensor) -> Result<Tensor> {
        let n_rep = self.num_heads / self.num_kv_heads;
        if n_rep == 1 {
            return Ok(x);
        }
        let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;
        x.unsqueeze(2)?
            .expand((batch, num_kv_heads, n_rep, seq_len, head_dim))?
            .reshape((batch, num_kv_heads * n_rep, seq_len, head_dim))
    }
}

/// Causal decoder returning next-token logits.
pub struct CausalDecoder {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rope: RotaryEmbedding,
    max_positions: usize,
    config: DecoderConfig,
    dtype: DType,
    device: Device,
}

impl std::fmt::Debug for CausalDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CausalDecoder")
            .field("hidden_size", &self.config.hidden_size)
            .field("num_layers", &self.layers.len())
            .field("vocab_size", &self.config.vocab_size)
            .field("dtype", &self.dtype)
            .field("device", &format!("{:?}", self.device))
            .finish()
    }
}

impl CausalDecoder {
    /// Builds the decoder from a var builder rooted at the checkpoint top level.
    pub fn load(vb: VarBuilder, config: &DecoderConfig) -> Result<Self> {
        let dtype = vb.dtype();
        let device = vb.device().clone();
        let attention_bias = config
            .attention_bias
            .unwrap_or_else(|| vb.contains_tensor("model.layers.0.self_attn.q_proj.bias"));
        let tied = config.tie_word_embeddings || !vb.contains_tensor("lm_head.weight");

        let model_vb = vb.pp("model");
        let embed_tokens = candle_nn::embedding(
            config.vocab_size,
            config.hidden_size,
            model_vb.pp("embed_tokens"),
        )?;

        let layers_vb = model_vb.pp("layers");
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for layer_idx in 0..config.num_hidden_layers {
            layers.push(DecoderLayer::load(
                layers_vb.pp(layer_idx),
                config,
                attention_bias,
            )?);
        }

        let norm = candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, model_vb.pp("norm"))?;

        let lm_head = if tied {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            candle_nn::linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        };

        let max_positions = config.max_position_embeddings.min(MAX_ROPE_POSITIONS);
        let rope = RotaryEmbedding::new(config, max_positions, dtype, &device)?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rope,
            max_positions,
            config: config.clone(),
            dtype,
            device,
        })
    }

    /// Memory-maps safetensors shards and builds the decoder at `dtype`.
    pub fn from_safetensors(
        weights: &[PathBuf],
        config: &DecoderConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        // SAFETY: the shards are treated as read-only for the lifetime of the model.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(weights, dtype, device)? };
        Self::load(vb, config)
    }

    /// Randomly initialised decoder for tests.
    #[cfg(any(test, feature = "mock"))]
    pub fn random(config: &DecoderConfig, dtype: DType, device: &Device) -> Result<Self> {
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        Self::load(vb, config)
    }

    /// `[batch, seq]` token ids -> `[batch, seq, hidden]` embeddings.
    pub fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.embed_tokens.forward(input_ids)
    }

    /// Runs the decoder over `[batch, seq, hidden]` embeddings placed at `offset`.
    ///
    /// Returns logits of shape `[batch, seq, vocab]` in the model dtype.
    pub fn forward_with_cache(
        &self,
        inputs_embeds: &Tensor,
        offset: usize,
        cache: &mut DecoderCache,
    ) -> Result<Tensor> {
        let (_batch, seq_len, _hidden) = inputs_embeds.dims3()?;
        let mask = if seq_len > 1 {
            Some(self.causal_mask(seq_len, offset)?)
        } else {
            None
        };

        let mut hidden = inputs_embeds.clone();
        for (layer, slot) in self.layers.iter().zip(cache.layers.iter_mut()) {
            hidden = layer.forward(&hidden, mask.as_ref(), &self.rope, offset, slot)?;
        }

        let hidden = self.norm.forward(&hidden)?;
        self.lm_head.forward(&hidden)
    }

    /// Empty cache sized for this model.
    pub fn new_cache(&self) -> DecoderCache {
        DecoderCache::new(self.layers.len())
    }

    /// `[1, 1, seq_len, offset + seq_len]` mask: 0 where attending is allowed, -inf elsewhere.
    fn causal_mask(&self, seq_len: usize, offset: usize) -> Result<Tensor> {
        let total = offset + seq_len;
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| {
                (0..total).map(move |j| if j <= i + offset { 0.0 } else { f32::NEG_INFINITY })
            })
            .collect();

        Tensor::from_vec(mask, (1, 1, seq_len, total), &self.device)
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub(crate) fn check_positions(&self, len: usize) -> std::result::Result<(), ModelError> {
        if len > self.max_positions {
            return Err(ModelError::SequenceTooLong {
                len,
                max: self.max_positions,
            });
        }
        Ok(())
    }
}

impl CausalModel for CausalDecoder {
    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn max_positions(&self) -> usize {
        self.max_positions
    }

    fn embed_tokens(&self, ids: &[u32]) -> std::result::Result<Tensor, ModelError> {
        let input_ids = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        Ok(self.embed(&input_ids)?)
    }

    fn forward_embeds(&self, inputs_embeds: &Tensor) -> std::result::Result<Tensor, ModelError> {
        let (_batch, seq_len, hidden) = inputs_embeds.dims3()?;
        if hidden != self.config.hidden_size {
            return Err(ModelError::InferenceFailed {
                reason: format!(
                    "input hidden size {} does not match model hidden size {}",
                    hidden, self.config.hidden_size
                ),
            });
        }
        self.check_positions(seq_len)?;

        let mut cache = self.new_cache();
        let inputs_embeds = inputs_embeds.to_dtype(self.dtype)?;
        Ok(self.forward_with_cache(&inputs_embeds, 0, &mut cache)?)
    }
}
