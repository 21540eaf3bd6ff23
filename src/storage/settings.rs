//! Settings storage
//!
//! Inference settings persisted as JSON in the data directory, with a few
//! environment overrides for machine-specific values.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::inference::{ContextConfig, GenerationRequest, ModelConfig, SamplingConfig, DEFAULT_SEED};
use crate::storage::models::default_models_directory;
use crate::storage::{get_data_dir, StorageError};

/// Environment variable overriding [`LlmSettings::gpu_layers`]
pub const ENV_GPU_LAYERS: &str = "NOVEL_LLM_GPU_LAYERS";
/// Environment variable overriding [`LlmSettings::threads`]
pub const ENV_THREADS: &str = "NOVEL_LLM_THREADS";
/// Environment variable overriding [`LlmSettings::threads_batch`]
pub const ENV_THREADS_BATCH: &str = "NOVEL_LLM_THREADS_BATCH";

/// Inference settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// Directory scanned for `.gguf` files
    pub models_directory: PathBuf,
    /// Model to load; when unset the first file in `models_directory` is used
    pub model_path: Option<PathBuf>,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub main_gpu: i32,
    /// Context window size in tokens
    pub context_size: u32,
    pub batch_size: u32,
    /// Generation threads (0 = library default)
    pub threads: i32,
    /// Prompt processing threads (0 = library default)
    pub threads_batch: i32,
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Top-k sampling parameter
    pub top_k: i32,
    pub seed: u32,
    /// Maximum number of tokens to generate per reply
    pub max_tokens: u32,
    /// System prompt prepended to every conversation
    pub system_prompt: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        let model = ModelConfig::default();
        let context = ContextConfig::default();
        let sampling = SamplingConfig::default();

        Self {
            models_directory: default_models_directory().unwrap_or_else(|_| PathBuf::from("./models")),
            model_path: None,
            gpu_layers: model.gpu_layers,
            use_mmap: model.use_mmap,
            use_mlock: model.use_mlock,
            main_gpu: model.main_gpu,
            context_size: context.context_size,
            batch_size: context.batch_size,
            threads: context.threads,
            threads_batch: context.threads_batch,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            seed: DEFAULT_SEED,
            max_tokens: GenerationRequest::default().max_tokens,
            system_prompt: String::new(),
        }
    }
}

impl LlmSettings {
    /// Clamps every value into its accepted range
    pub fn validate(&mut self) {
        let defaults = Self::default();

        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);

        if self.top_k <= 0 {
            self.top_k = defaults.top_k;
        }
        if self.max_tokens == 0 {
            self.max_tokens = defaults.max_tokens;
        }
        if self.context_size == 0 {
            self.context_size = defaults.context_size;
        }
        if self.batch_size == 0 {
            self.batch_size = defaults.batch_size;
        }
        self.batch_size = self.batch_size.min(self.context_size);
        self.threads = self.threads.max(0);
        self.threads_batch = self.threads_batch.max(0);
    }

    /// Applies `NOVEL_LLM_*` environment variables on top of these settings
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = parse_override(&lookup, ENV_GPU_LAYERS) {
            self.gpu_layers = v;
        }
        if let Some(v) = parse_override(&lookup, ENV_THREADS) {
            self.threads = v;
        }
        if let Some(v) = parse_override(&lookup, ENV_THREADS_BATCH) {
            self.threads_batch = v;
        }
    }

    pub fn model_config(&self, model_path: impl Into<PathBuf>) -> ModelConfig {
        ModelConfig {
            model_path: model_path.into(),
            gpu_layers: self.gpu_layers,
            use_mmap: self.use_mmap,
            use_mlock: self.use_mlock,
            vocab_only: false,
            main_gpu: self.main_gpu,
        }
    }

    pub fn context_config(&self) -> ContextConfig {
        ContextConfig {
            context_size: self.context_size,
            batch_size: self.batch_size,
            threads: self.threads,
            threads_batch: self.threads_batch,
        }
    }

    pub fn sampling_config(&self) -> SamplingConfig {
        SamplingConfig {
            top_k: self.top_k,
            top_p: self.top_p,
            temperature: self.temperature,
            seed: self.seed,
        }
    }

    /// Request for `prompt` with the configured token budget
    pub fn request(&self, prompt: impl Into<String>) -> GenerationRequest {
        GenerationRequest::new(prompt, self.max_tokens)
    }
}

fn parse_override<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => {
            tracing::debug!("{} overridden from environment", name);
            Some(value)
        }
        Err(_) => {
            tracing::warn!("Ignoring {}={:?}: not a valid number", name, raw);
            None
        }
    }
}

fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk, then apply environment overrides.
///
/// Returns default settings if the file doesn't exist or is corrupted.
pub fn load_settings() -> LlmSettings {
    let mut settings = match get_settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            LlmSettings::default()
        }
    };
    settings.apply_env_overrides();
    settings
}

/// Load and validate settings from `path`; a missing file yields defaults.
pub fn load_settings_from(path: &Path) -> Result<LlmSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(LlmSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: LlmSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to the data directory
pub fn save_settings(settings: &LlmSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

pub fn save_settings_to(settings: &LlmSettings, path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}
