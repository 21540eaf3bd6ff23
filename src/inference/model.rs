//! Model weights
//!
//! [`ModelHandle`] owns one set of loaded weights plus vocabulary. It is
//! immutable after loading and is shared between engines as
//! `Arc<ModelHandle<B>>`; the native weights are freed when the last `Arc`
//! goes away.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::backend::{Backend, NativeModel};
use crate::inference::engine::EngineError;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Fixed-size part of a GGUF header: magic, version, tensor and kv counts.
const GGUF_HEADER_LEN: usize = 24;

/// Errors found while inspecting a model file header
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open model file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Not a GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to hold a GGUF header")]
    FileTooSmall,
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelLoadFailed(e.to_string())
    }
}

/// Header fields of a GGUF file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// Checks that `path` starts with a GGUF v2/v3 header and returns it.
///
/// Cheap enough to run before handing the file to the native loader, which
/// gives far less useful errors for a wrong path or a truncated download.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, ModelError> {
    let mut file = File::open(path)?;

    let mut header = [0u8; GGUF_HEADER_LEN];
    let mut filled = 0;
    while filled < GGUF_HEADER_LEN {
        match file.read(&mut header[filled..])? {
            0 => return Err(ModelError::FileTooSmall),
            n => filled += n,
        }
    }

    let u32_at = |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
    let u64_at = |at: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&header[at..at + 8]);
        u64::from_le_bytes(bytes)
    };

    let magic = u32_at(0);
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    let version = u32_at(4);
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    Ok(GgufHeader {
        version,
        tensor_count: u64_at(8),
        metadata_kv_count: u64_at(16),
    })
}

/// Parameters for loading a model file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path to the GGUF weights file
    pub model_path: PathBuf,
    /// Number of layers to offload to the GPU (0 = CPU only)
    pub gpu_layers: u32,
    /// Memory-map the weights file instead of reading it
    pub use_mmap: bool,
    /// Pin the weights in RAM
    pub use_mlock: bool,
    /// Load only the vocabulary, no tensors
    pub vocab_only: bool,
    /// Index of the GPU that holds non-split tensors
    pub main_gpu: i32,
}

impl ModelConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            ..Self::default()
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            gpu_layers: 0,
            use_mmap: true,
            use_mlock: false,
            vocab_only: false,
            main_gpu: 0,
        }
    }
}

/// Loaded weights and vocabulary.
///
/// A handle only exists if both weights and vocabulary loaded, so holding
/// one is proof of validity. It is deliberately not `Clone`: share it
/// through `Arc`.
pub struct ModelHandle<B: Backend> {
    native: B::Model,
    backend: Arc<B>,
    config: ModelConfig,
}

impl<B: Backend> ModelHandle<B> {
    /// Loads weights through `backend`.
    ///
    /// If the weights load but the vocabulary comes back empty, the weights
    /// are dropped again and `VocabLoadFailed` is returned.
    pub fn load(backend: Arc<B>, config: &ModelConfig) -> Result<Self, EngineError> {
        let native = backend.load_model(config)?;

        if native.n_vocab() == 0 {
            tracing::error!("Model {:?} loaded without a vocabulary", config.model_path);
            return Err(EngineError::VocabLoadFailed(format!(
                "{} has an empty vocabulary",
                config.model_path.display()
            )));
        }

        tracing::info!(
            "Model loaded: {} ({} vocab, {} gpu layers)",
            config.model_path.display(),
            native.n_vocab(),
            config.gpu_layers
        );

        Ok(Self {
            native,
            backend,
            config: config.clone(),
        })
    }

    /// Native weights, for tokenization and piece lookup
    pub fn native(&self) -> &B::Model {
        &self.native
    }

    /// Backend that loaded these weights; also builds contexts for them
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config.model_path
    }

    pub fn n_vocab(&self) -> usize {
        self.native.n_vocab()
    }
}

impl<B: Backend> fmt::Debug for ModelHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("path", &self.config.model_path)
            .field("n_vocab", &self.native.n_vocab())
            .finish()
    }
}
