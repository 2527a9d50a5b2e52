//! Lazily populated cache of loaded target models.
//!
//! Each identifier is loaded at most once: concurrent callers for a missing entry block
//! on the single in-flight load and then share its result. Loading itself is serialized
//! across identifiers by a process-wide lock; lookups of published entries never take it.
//! Failed loads are not cached, so the next request retries from scratch.

use std::sync::Arc;
use std::time::Instant;

use candle_core::Device;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::model::{
    CausalModel, LoadedModel, ModelError, ModelLoader, TextGenerator, TokenCodec,
    reclaim_device_memory,
};


#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to load model '{identifier}': {source}")]
    LoadFailed {
        identifier: String,
        #[source]
        source: Arc<ModelError>,
    },
}

/// A loaded model together with its tokenizer, generation adapter and device.
pub struct CachedModel {
    pub identifier: String,
    pub model: Arc<dyn CausalModel>,
    pub tokenizer: Arc<dyn TokenCodec>,
    pub generator: Arc<dyn TextGenerator>,
    pub device: Device,
}

impl std::fmt::Debug for CachedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedModel")
            .field("identifier", &self.identifier)
            .field("hidden_size", &self.model.hidden_size())
            .field("device", &format!("{:?}", self.device))
            .finish()
    }
}

impl CachedModel {
    fn new(identifier: &str, loaded: LoadedModel, device: Device) -> Self {
        Self {
            identifier: identifier.to_string(),
            model: loaded.model,
            tokenizer: loaded.tokenizer,
            generator: loaded.generator,
            device,
        }
    }
}

/// Identifier -> [`CachedModel`] cache backed by a [`ModelLoader`].
pub struct ModelRegistry {
    entries: Cache<String, Arc<CachedModel>>,
    loader: Arc<dyn ModelLoader>,
    device: Device,
    load_lock: Mutex<()>,
}

impl ModelRegistry {
    /// Creates a registry that never evicts.
    pub fn new(loader: Arc<dyn ModelLoader>, device: Device) -> Self {
        Self {
            entries: Cache::builder().build(),
            loader,
            device,
            load_lock: Mutex::new(()),
        }
    }

    /// Creates a registry holding at most `capacity` models (LRU eviction).
    ///
    /// An evicted model stays alive until the last in-flight request drops its handle.
    pub fn with_capacity(loader: Arc<dyn ModelLoader>, device: Device, capacity: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(capacity)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
            loader,
            device,
            load_lock: Mutex::new(()),
        }
    }

    /// Returns the cached entry for `identifier`, loading it on first use.
    pub fn ensure_ready(&self, identifier: &str) -> Result<Arc<CachedModel>, RegistryError> {
        let result = self
            .entries
            .try_get_with(identifier.to_string(), || self.load(identifier));

        reclaim_device_memory(&self.device);

        result.map_err(|source| {
            error!(identifier, error = %source, "Model load failed");
            RegistryError::LoadFailed {
                identifier: identifier.to_string(),
                source,
            }
        })
    }

    fn load(&self, identifier: &str) -> Result<Arc<CachedModel>, ModelError> {
        let _guard = self.load_lock.lock();
        let started = Instant::now();
        info!(identifier, device = ?self.device, "Loading model");

        let loaded = self.loader.load(identifier, &self.device)?;
        let entry = CachedModel::new(identifier, loaded, self.device.clone());

        info!(
            identifier,
            hidden_size = entry.model.hidden_size(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Model ready"
        );
        Ok(Arc::new(entry))
    }

    /// Loads every identifier in `identifiers`, stopping at the first failure.
    pub fn preload(&self, identifiers: &[String]) -> Result<(), RegistryError> {
        for identifier in identifiers {
            debug!(identifier, "Preloading model");
            self.ensure_ready(identifier)?;
        }
        Ok(())
    }

    /// Returns `true` if `identifier` is cached (no load is triggered).
    pub fn is_loaded(&self, identifier: &str) -> bool {
        self.entries.contains_key(identifier)
    }

    /// Number of cached models after pending evictions have been applied.
    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}
