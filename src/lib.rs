//! condense-oracle library crate (used by the server binary and integration tests).
//!
//! Scores miner-submitted compressed contexts against a causal language model. A batch
//! names a model, a set of allowed criteria and a reference prompt/completion; each
//! submission is a base64-encoded `.npy` array of embedding vectors that stands in for
//! the original context.
//!
//! ## Modules
//! - [`config`] - `CONDENSE_*` environment configuration
//! - [`model`] - decoder, tokenizer and generation adapters over candle
//! - [`registry`] - load-once model cache shared by concurrent requests
//! - [`payload`] - base64 / `.npy` decoding and remote array download
//! - [`scoring`] - criterion evaluators, judge and batch orchestration
//! - [`gateway`] - Axum router exposing `POST /scoring`
//!
//! ## Test/Mock Support
//! Mock loaders, tokenizers and generators are available behind
//! `#[cfg(any(test, feature = "mock"))]`.

pub mod config;
pub mod constants;
pub mod gateway;
pub mod model;
pub mod payload;
pub mod registry;
pub mod scoring;

pub use config::{Config, ConfigError, ModelDtype};
pub use constants::{ACCURACY_PENALTY, EMPTY_COMPLETION_FALLBACK, LOSS_PENALTY};
pub use gateway::{GatewayError, HandlerState, create_router_with_state};
#[cfg(any(test, feature = "mock"))]
pub use model::mock::{CharTokenizer, MockModelLoader, ScriptedGenerator};
pub use model::{
    CausalModel, LoadedModel, ModelError, ModelLoader, PretrainedLoader, TextGenerator,
    TokenCodec,
};
pub use payload::{CompressedTokens, PayloadError, decode_compressed_tokens, fetch_npy};
pub use registry::{CachedModel, ModelRegistry, RegistryError};
pub use scoring::{
    BatchScoringRequest, Criterion, GroundTruthSpec, MinerSubmission, ScoringError,
    ScoringResult, ScoringService, ScoringSettings,
};
