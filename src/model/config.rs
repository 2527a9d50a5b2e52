use std::path::Path;

use serde::Deserialize;

use super::error::ModelError;

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_max_position_embeddings() -> usize {
    4096
}

/// Token id field that may be a scalar or a list in `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    Single(u32),
    Many(Vec<u32>),
}

impl TokenIds {
    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            TokenIds::Single(id) => vec![*id],
            TokenIds::Many(ids) => ids.clone(),
        }
    }
}

/// `rope_scaling` block of `config.json`.
///
/// `default` and `linear` keep or uniformly stretch the base frequencies; `llama3`
/// rescales only the low-frequency band.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RopeScaling {
    #[serde(alias = "type")]
    pub rope_type: String,
    #[serde(default)]
    pub factor: Option<f64>,
    #[serde(default)]
    pub low_freq_factor: Option<f64>,
    #[serde(default)]
    pub high_freq_factor: Option<f64>,
    #[serde(default)]
    pub original_max_position_embeddings: Option<usize>,
}

/// Decoder hyper-parameters read from a Hugging Face `config.json`.
///
/// Covers the Llama / Mistral / Qwen2 family (pre-norm, RoPE, GQA, SwiGLU).
#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    pub vocab_size: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// Explicit q/k/v bias flag. Qwen2 omits it and ships biases anyway.
    #[serde(default)]
    pub attention_bias: Option<bool>,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,
    #[serde(default)]
    pub bos_token_id: Option<TokenIds>,
}

impl DecoderConfig {
    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        if !path.exists() {
            return Err(ModelError::ModelNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| ModelError::InvalidConfig {
                reason: format!("failed to parse {}: {}", path.display(), e),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads.max(1))
    }

    pub fn eos_token_ids(&self) -> Vec<u32> {
        self.eos_token_id
            .as_ref()
            .map(TokenIds::to_vec)
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.hidden_size == 0 || self.num_attention_heads == 0 || self.vocab_size == 0 {
            return Err(ModelError::InvalidConfig {
                reason: "hidden_size, num_attention_heads and vocab_size must be non-zero"
                    .to_string(),
            });
        }

        if self.head_dim.is_none() && !self.hidden_size.is_multiple_of(self.num_attention_heads)
        {
            return Err(ModelError::InvalidConfig {
                reason: format!(
                    "hidden_size ({}) is not divisible by num_attention_heads ({})",
                    self.hidden_size, self.num_attention_heads
                ),
            });
        }

        if !self.head_dim().is_multiple_of(2) {
            return Err(ModelError::InvalidConfig {
                reason: format!("head_dim ({}) must be even for RoPE", self.head_dim()),
            });
        }

        let kv_heads = self.num_kv_heads();
        if kv_heads == 0 || !self.num_attention_heads.is_multiple_of(kv_heads) {
            return Err(ModelError::InvalidConfig {
                reason: format!(
                    "num_attention_heads ({}) is not a multiple of num_key_value_heads ({})",
                    self.num_attention_heads, kv_heads
                ),
            });
        }

        self.validate_rope_scaling()
    }

    fn validate_rope_scaling(&self) -> Result<(), ModelError> {
        let Some(scaling) = &self.rope_scaling else {
            return Ok(());
        };
        let invalid = |reason: String| Err(ModelError::InvalidConfig { reason });

        match scaling.rope_type.as_str() {
            "default" => Ok(()),
            "linear" => match scaling.factor {
                Some(factor) if factor > 0.0 => Ok(()),
                _ => invalid("linear rope_scaling needs a positive factor".to_string()),
            },
            "llama3" => match (
                scaling.factor,
                scaling.low_freq_factor,
                scaling.high_freq_factor,
                scaling.original_max_position_embeddings,
            ) {
                (Some(factor), Some(low), Some(high), Some(original))
                    if factor > 0.0 && low > 0.0 && high > low && original > 0 =>
                {
                    Ok(())
                }
                _ => invalid(
                    "llama3 rope_scaling needs factor, low_freq_factor < high_freq_factor and \
                     original_max_position_embeddings"
                        .to_string(),
                ),
            },
            other => invalid(format!("unsupported rope_scaling type '{other}'")),
        }
    }

    /// Rotary inverse frequencies for one head, `head_dim / 2` entries, with any
    /// `rope_scaling` applied.
    pub fn rope_inv_freq(&self) -> Vec<f32> {
        let head_dim = self.head_dim();
        let base: Vec<f64> = (0..head_dim / 2)
            .map(|i| 1.0 / self.rope_theta.powf((2 * i) as f64 / head_dim as f64))
            .collect();

        let scaled: Vec<f64> = match &self.rope_scaling {
            Some(RopeScaling {
                rope_type,
                factor: Some(factor),
                ..
            }) if rope_type == "linear" => base.iter().map(|f| f / factor).collect(),
            Some(RopeScaling {
                rope_type,
                factor: Some(factor),
                low_freq_factor: Some(low),
                high_freq_factor: Some(high),
                original_max_position_embeddings: Some(original),
            }) if rope_type == "llama3" => {
                let original = *original as f64;
                let low_freq_wavelen = original / low;
                let high_freq_wavelen = original / high;
                base.iter()
                    .map(|&freq| {
                        let wavelen = 2.0 * std::f64::consts::PI / freq;
                        if wavelen < high_freq_wavelen {
                            freq
                        } else if wavelen > low_freq_wavelen {
                            freq / factor
                        } else {
                            let smooth = (original / wavelen - low) / (high - low);
                            (1.0 - smooth) * freq / factor + smooth * freq
                        }
                    })
                    .collect()
            }
            _ => base,
        };

        scaled.into_iter().map(|f| f as f32).collect()
    }

    /// Small configuration for randomly initialised test decoders.
    #[cfg(any(test, feature = "mock"))]
    pub fn tiny(hidden_size: usize, vocab_size: usize) -> Self {
        Self {
            hidden_size,
            intermediate_size: hidden_size * 2,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            head_dim: None,
            rms_norm_eps: 1e-6,
            rope_theta: 10_000.0,
            vocab_size,
            max_position_embeddings: 512,
            tie_word_embeddings: true,
            attention_bias: Some(false),
            rope_scaling: None,
            eos_token_id: None,
            bos_token_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(extra: serde_json::Value) -> (tempfile::TempDir, std::path::PathBuf) {
        let mut config = serde_json::json!({
            "hidden_size": 64,
            "intermediate_size": 128,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "vocab_size": 100,
            "rope_theta": 500000.0,
            "max_position_embeddings": 8192
        });
        if let (Some(map), Some(extra)) = (config.as_object_mut(), extra.as_object()) {
            map.extend(extra.clone());
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, config.to_string()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_parses_llama3_rope_scaling() {
        let (_dir, path) = write_config(serde_json::json!({
            "rope_scaling": {
                "rope_type": "llama3",
                "factor": 8.0,
                "low_freq_factor": 1.0,
                "high_freq_factor": 4.0,
                "original_max_position_embeddings": 8192
            }
        }));

        let config = DecoderConfig::from_file(&path).unwrap();
        let scaling = config.rope_scaling.as_ref().unwrap();
        assert_eq!(scaling.rope_type, "llama3");
        assert_eq!(scaling.factor, Some(8.0));
    }

    #[test]
    fn test_llama3_remap_scales_only_low_frequencies() {
        let (_dir, path) = write_config(serde_json::json!({
            "rope_scaling": {
                "rope_type": "llama3",
                "factor": 8.0,
                "low_freq_factor": 1.0,
                "high_freq_factor": 4.0,
                "original_max_position_embeddings": 8192
            }
        }));
        let scaled = DecoderConfig::from_file(&path).unwrap();
        let plain = DecoderConfig {
            rope_scaling: None,
            ..scaled.clone()
        };

        let scaled_freq = scaled.rope_inv_freq();
        let plain_freq = plain.rope_inv_freq();
        assert_eq!(scaled_freq.len(), 8);

        // Highest frequency: wavelength 2*pi, far below 8192 / 4.
        assert_eq!(scaled_freq[0], plain_freq[0]);
        // Lowest frequency: wavelength far above 8192, divided by the factor.
        let last = plain_freq.len() - 1;
        assert!((scaled_freq[last] - plain_freq[last] / 8.0).abs() < 1e-12);
        for (s, p) in scaled_freq.iter().zip(plain_freq.iter()) {
            assert!(s <= p);
            assert!(*s >= p / 8.0 - 1e-12);
        }
    }

    #[test]
    fn test_linear_rope_scaling_divides_every_frequency() {
        let (_dir, path) = write_config(serde_json::json!({
            "rope_scaling": {"type": "linear", "factor": 2.0}
        }));
        let config = DecoderConfig::from_file(&path).unwrap();
        let plain = DecoderConfig {
            rope_scaling: None,
            ..config.clone()
        };

        for (s, p) in config.rope_inv_freq().iter().zip(plain.rope_inv_freq().iter()) {
            assert!((s - p / 2.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_rejects_unsupported_rope_scaling() {
        let (_dir, path) = write_config(serde_json::json!({
            "rope_scaling": {"rope_type": "yarn", "factor": 4.0}
        }));
        let err = DecoderConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ModelError::InvalidConfig { ref reason } if reason.contains("yarn")));
    }

    #[test]
    fn test_rejects_incomplete_llama3_rope_scaling() {
        let (_dir, path) = write_config(serde_json::json!({
            "rope_scaling": {"rope_type": "llama3", "factor": 8.0}
        }));
        assert!(matches!(
            DecoderConfig::from_file(&path),
            Err(ModelError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_null_rope_scaling_is_plain() {
        let (_dir, path) = write_config(serde_json::json!({"rope_scaling": null}));
        let config = DecoderConfig::from_file(&path).unwrap();
        assert!(config.rope_scaling.is_none());
        assert_eq!(config.rope_inv_freq()[0], 1.0);
    }
}
