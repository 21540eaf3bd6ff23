//! Model registry
//!
//! Loads each model once per key and hands out shared handles. Constructed
//! by the application and passed around by reference; there is no global
//! instance.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::inference::backend::Backend;
use crate::inference::engine::EngineError;
use crate::inference::model::{ModelConfig, ModelHandle};
use crate::lock_unpoisoned;
use crate::storage::models::scan_models_directory;

/// Keyed store of loaded models
pub struct ModelRegistry<B: Backend> {
    backend: Arc<B>,
    models: Mutex<HashMap<String, Arc<ModelHandle<B>>>>,
}

impl<B: Backend> ModelRegistry<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            models: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Loads the model for `key` unless it is already registered.
    ///
    /// Loading happens under the registry lock, so concurrent calls for the
    /// same key load once. On failure the registry is left unchanged.
    pub fn initialize_model(&self, key: &str, config: &ModelConfig) -> Result<(), EngineError> {
        let mut models = lock_unpoisoned(&self.models);

        if models.contains_key(key) {
            tracing::debug!("Model '{}' already initialized", key);
            return Ok(());
        }

        let handle = ModelHandle::load(Arc::clone(&self.backend), config).map_err(|e| {
            tracing::error!("Failed to initialize model '{}': {}", key, e);
            e
        })?;
        models.insert(key.to_string(), Arc::new(handle));

        tracing::info!("Model '{}' initialized", key);
        Ok(())
    }

    /// Registers every `.gguf` file in `directory` under its file stem.
    ///
    /// `template` supplies everything but the path. Returns the keys that
    /// are registered afterwards; files that fail to load are skipped.
    pub fn initialize_from_directory(&self, directory: &Path, template: &ModelConfig) -> Vec<String> {
        let found = match scan_models_directory(directory) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Failed to scan {}: {}", directory.display(), e);
                return Vec::new();
            }
        };

        found
            .into_iter()
            .filter_map(|info| {
                let key = info.key();
                let config = ModelConfig {
                    model_path: info.path,
                    ..template.clone()
                };
                self.initialize_model(&key, &config).ok().map(|()| key)
            })
            .collect()
    }

    /// Shared handle for `key`, if registered
    pub fn get_model(&self, key: &str) -> Option<Arc<ModelHandle<B>>> {
        let model = lock_unpoisoned(&self.models).get(key).cloned();
        if model.is_none() {
            tracing::debug!("Model '{}' not found", key);
        }
        model
    }

    pub fn is_model_initialized(&self, key: &str) -> bool {
        lock_unpoisoned(&self.models).contains_key(key)
    }

    /// Drops the registry's reference. Engines holding the handle keep
    /// working; the weights are freed with the last reference.
    pub fn release_model(&self, key: &str) {
        if lock_unpoisoned(&self.models).remove(key).is_some() {
            tracing::info!("Model '{}' released", key);
        }
    }

    pub fn release_all(&self) {
        let mut models = lock_unpoisoned(&self.models);
        tracing::info!("Releasing all {} model(s)", models.len());
        models.clear();
    }

    /// Registered keys, sorted
    pub fn initialized_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock_unpoisoned(&self.models).keys().cloned().collect();
        keys.sort();
        keys
    }
}
