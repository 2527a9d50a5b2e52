//! Target-model runtime.
//!
//! - [`decoder`] implements a Llama-family causal decoder driven by input embeddings.
//! - [`generation`] adds greedy KV-cached decoding and the [`TextGenerator`] adapter.
//! - [`loader`] resolves model identifiers to safetensors checkpoints.
//!
//! Scoring code only sees the [`CausalModel`], [`TokenCodec`] and [`TextGenerator`]
//! traits, so tests can swap in the doubles from `mock`.

/// Chat formatting for single-turn prompts.
pub mod chat;
/// `config.json` hyper-parameters.
pub mod config;
/// Llama / Mistral / Qwen2 decoder.
pub mod decoder;
/// Device selection (CPU / Metal / CUDA).
pub mod device;
mod error;
pub mod generation;
pub mod loader;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
/// Tokenizer loading helpers.
pub mod tokenizer;
pub mod traits;

pub use chat::ChatTemplate;
pub use config::DecoderConfig;
pub use decoder::{CausalDecoder, DecoderCache};
pub use device::{reclaim_device_memory, select_device};
pub use error::ModelError;
pub use generation::{DecoderGenerator, generate_tokens};
pub use loader::{LoadedModel, ModelArtifacts, ModelLoader, PretrainedLoader};
pub use traits::{CausalModel, TextGenerator, TokenCodec};
