//! Model artifact resolution and loading.
//!
//! An identifier resolves to `<models_dir>/<identifier>` when that directory exists,
//! otherwise to the Hugging Face hub cache (downloading on first use).

use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device};
use serde::Deserialize;
use tracing::{debug, info};

use super::config::DecoderConfig;
use super::decoder::CausalDecoder;
use super::error::ModelError;
use super::generation::DecoderGenerator;
use super::tokenizer::load_tokenizer;
use super::traits::{CausalModel, TextGenerator, TokenCodec};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Model, tokenizer and generation adapter produced by a [`ModelLoader`].
#[derive(Clone)]
pub struct LoadedModel {
    pub model: Arc<dyn CausalModel>,
    pub tokenizer: Arc<dyn TokenCodec>,
    pub generator: Arc<dyn TextGenerator>,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel").finish_non_exhaustive()
    }
}

/// Builds a [`LoadedModel`] for an identifier on a device.
pub trait ModelLoader: Send + Sync {
    fn load(&self, identifier: &str, device: &Device) -> Result<LoadedModel, ModelError>;
}

/// Files needed to build a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifacts {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

/// Shard file names referenced by a `model.safetensors.index.json`, sorted and deduplicated.
pub fn shard_names_from_index(index_path: &Path) -> Result<Vec<String>, ModelError> {
    let content = std::fs::read_to_string(index_path)?;
    let index: SafetensorsIndex =
        serde_json::from_str(&content).map_err(|e| ModelError::ModelLoadFailed {
            reason: format!("invalid safetensors index {}: {}", index_path.display(), e),
        })?;

    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    if shards.is_empty() {
        return Err(ModelError::ModelLoadFailed {
            reason: format!("safetensors index {} lists no shards", index_path.display()),
        });
    }
    Ok(shards.into_iter().collect())
}

/// Loads safetensors checkpoints of Llama-family decoders.
#[derive(Debug, Clone)]
pub struct PretrainedLoader {
    models_dir: Option<PathBuf>,
    dtype: DType,
}

impl PretrainedLoader {
    pub fn new(models_dir: Option<PathBuf>, dtype: DType) -> Self {
        Self { models_dir, dtype }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Locates config, tokenizer and weight files for `identifier`.
    pub fn resolve(&self, identifier: &str) -> Result<ModelArtifacts, ModelError> {
        validate_identifier(identifier)?;

        if let Some(root) = &self.models_dir {
            let dir = root.join(identifier);
            if dir.is_dir() {
                debug!(identifier, dir = %dir.display(), "Resolving model from local directory");
                return resolve_local(&dir);
            }
        }

        resolve_hub(identifier)
    }
}

impl ModelLoader for PretrainedLoader {
    fn load(&self, identifier: &str, device: &Device) -> Result<LoadedModel, ModelError> {
        let artifacts = self.resolve(identifier)?;
        let config = DecoderConfig::from_file(&artifacts.config)?;

        let tokenizer = load_tokenizer(&artifacts.tokenizer).map_err(|e| {
            ModelError::TokenizationFailed {
                reason: format!("Failed to load tokenizer: {}", e),
            }
        })?;

        info!(
            identifier,
            shards = artifacts.weights.len(),
            dtype = ?self.dtype,
            hidden_size = config.hidden_size,
            num_layers = config.num_hidden_layers,
            "Loading decoder weights"
        );

        let model = CausalDecoder::from_safetensors(&artifacts.weights, &config, self.dtype, device)
            .map_err(|e| ModelError::ModelLoadFailed {
                reason: format!("Failed to load decoder '{}': {}", identifier, e),
            })?;

        let model = Arc::new(model);
        let tokenizer: Arc<dyn TokenCodec> = Arc::new(tokenizer);
        let generator = DecoderGenerator::new(model.clone(), tokenizer.clone());
        debug!(template = ?generator.template(), stop_ids = ?generator.stop_ids(), "Generation adapter ready");

        Ok(LoadedModel {
            model,
            tokenizer,
            generator: Arc::new(generator),
        })
    }
}

fn validate_identifier(identifier: &str) -> Result<(), ModelError> {
    let path = Path::new(identifier);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));

    if identifier.trim().is_empty() || escapes {
        return Err(ModelError::ResolveFailed {
            identifier: identifier.to_string(),
            reason: "identifier must be a relative name without '..' or root components"
                .to_string(),
        });
    }
    Ok(())
}

fn resolve_local(dir: &Path) -> Result<ModelArtifacts, ModelError> {
    let config = dir.join(CONFIG_FILE);
    if !config.exists() {
        return Err(ModelError::ModelNotFound { path: config });
    }

    let tokenizer = dir.join(TOKENIZER_FILE);
    if !tokenizer.exists() {
        return Err(ModelError::ModelNotFound { path: tokenizer });
    }

    let single = dir.join(SINGLE_WEIGHTS_FILE);
    let weights = if single.exists() {
        vec![single]
    } else {
        let index = dir.join(WEIGHTS_INDEX_FILE);
        if !index.exists() {
            return Err(ModelError::ModelNotFound { path: single });
        }
        let shards = shard_names_from_index(&index)?
            .into_iter()
            .map(|name| dir.join(name))
            .collect::<Vec<_>>();
        if let Some(missing) = shards.iter().find(|p| !p.exists()) {
            return Err(ModelError::ModelNotFound {
                path: missing.clone(),
            });
        }
        shards
    };

    Ok(ModelArtifacts {
        config,
        tokenizer,
        weights,
    })
}

fn resolve_hub(identifier: &str) -> Result<ModelArtifacts, ModelError> {
    let hub_error = |reason: String| ModelError::ResolveFailed {
        identifier: identifier.to_string(),
        reason,
    };

    info!(identifier, "Fetching model from Hugging Face hub");

    let api = hf_hub::api::sync::Api::new()
        .map_err(|e| hub_error(format!("failed to initialise hub client: {}", e)))?;
    let repo = api.model(identifier.to_string());

    let config = repo
        .get(CONFIG_FILE)
        .map_err(|e| hub_error(format!("failed to fetch {}: {}", CONFIG_FILE, e)))?;
    let tokenizer = repo
        .get(TOKENIZER_FILE)
        .map_err(|e| hub_error(format!("failed to fetch {}: {}", TOKENIZER_FILE, e)))?;

    let weights = match repo.get(SINGLE_WEIGHTS_FILE) {
        Ok(path) => vec![path],
        Err(single_err) => {
            debug!(error = %single_err, "No single-file checkpoint, trying sharded index");
            let index = repo
                .get(WEIGHTS_INDEX_FILE)
                .map_err(|e| hub_error(format!("no safetensors weights found: {}", e)))?;
            shard_names_from_index(&index)?
                .iter()
                .map(|name| {
                    repo.get(name)
                        .map_err(|e| hub_error(format!("failed to fetch shard {}: {}", name, e)))
                })
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    Ok(ModelArtifacts {
        config,
        tokenizer,
        weights,
    })
}
