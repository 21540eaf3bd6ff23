//! llama.cpp backend
//!
//! Implements the backend traits on top of `llama-cpp-2`. The native
//! library keeps global state, so [`LlamaCppBackend`] shares one
//! process-wide `LlamaBackend` that is initialized on first use.

use std::num::NonZeroU32;
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use once_cell::sync::OnceCell;

use crate::inference::backend::{Backend, NativeContext, NativeModel, NativeSampler, Token};
use crate::inference::context::ContextConfig;
use crate::inference::engine::{EngineError, GenerationEngine};
use crate::inference::model::{validate_gguf, ModelConfig, ModelHandle};
use crate::inference::registry::ModelRegistry;
use crate::inference::sampler::SamplingStage;

static LLAMA_BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

/// Engine running on llama.cpp
pub type LlamaEngine = GenerationEngine<LlamaCppBackend>;

/// Registry of llama.cpp models
pub type LlamaModelRegistry = ModelRegistry<LlamaCppBackend>;

/// Handle to the process-wide llama.cpp runtime
pub struct LlamaCppBackend {
    backend: &'static LlamaBackend,
}

impl LlamaCppBackend {
    /// Initializes llama.cpp on first call; later calls share that runtime.
    pub fn new() -> Result<Self, EngineError> {
        let backend = LLAMA_BACKEND.get_or_try_init(|| {
            let mut backend = LlamaBackend::init()
                .map_err(|e| EngineError::ModelLoadFailed(format!("Failed to initialize backend: {}", e)))?;
            backend.void_logs();
            tracing::info!("LlamaBackend initialized");
            Ok::<_, EngineError>(backend)
        })?;

        Ok(Self { backend })
    }
}

impl Backend for LlamaCppBackend {
    type Model = LlamaCppModel;
    type Context = LlamaCppContext;
    type Sampler = LlamaCppSampler;

    fn load_model(&self, config: &ModelConfig) -> Result<LlamaCppModel, EngineError> {
        let header = validate_gguf(&config.model_path)?;
        tracing::debug!(
            "GGUF v{} header: {} tensors, {} metadata entries",
            header.version,
            header.tensor_count,
            header.metadata_kv_count
        );

        if !config.use_mmap {
            tracing::warn!("use_mmap=false is not supported by this backend; weights are memory-mapped");
        }

        let params = LlamaModelParams::default()
            .with_n_gpu_layers(config.gpu_layers)
            .with_main_gpu(config.main_gpu)
            .with_vocab_only(config.vocab_only)
            .with_use_mlock(config.use_mlock);

        let model = LlamaModel::load_from_file(self.backend, &config.model_path, &params)
            .map_err(|e| EngineError::ModelLoadFailed(format!("{}: {}", config.model_path.display(), e)))?;

        Ok(LlamaCppModel(model))
    }

    fn new_context(
        &self,
        model: &Arc<ModelHandle<Self>>,
        config: &ContextConfig,
    ) -> Result<LlamaCppContext, EngineError> {
        let n_ctx = NonZeroU32::new(config.context_size)
            .ok_or_else(|| EngineError::ContextCreateFailed("context size must be non-zero".to_string()))?;

        let mut params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(config.batch_size);
        if config.threads > 0 {
            params = params.with_n_threads(config.threads);
        }
        if config.threads_batch > 0 {
            params = params.with_n_threads_batch(config.threads_batch);
        }

        let ctx = model
            .native()
            .0
            .new_context(self.backend, params)
            .map_err(|e| EngineError::ContextCreateFailed(e.to_string()))?;

        // SAFETY: the context borrows the `LlamaModel` inside `model`, which
        // lives on the heap behind an `Arc`. `LlamaCppContext` stores a clone
        // of that `Arc` in a field declared after `ctx`, so the model is
        // neither moved nor dropped before the context is.
        let ctx: LlamaContext<'static> = unsafe { std::mem::transmute(ctx) };

        Ok(LlamaCppContext {
            batch: LlamaBatch::new(config.batch_size as usize, 1),
            ctx,
            n_batch: config.batch_size as usize,
            n_ctx: config.context_size as usize,
            n_past: 0,
            _model: Arc::clone(model),
        })
    }

    fn new_sampler(&self, stages: &[SamplingStage]) -> Result<LlamaCppSampler, EngineError> {
        let chain = stages.iter().map(|stage| match *stage {
            SamplingStage::TopK(k) => LlamaSampler::top_k(k),
            SamplingStage::TopP(p) => LlamaSampler::top_p(p, 1),
            SamplingStage::Temperature(t) => LlamaSampler::temp(t),
            SamplingStage::Distribution(seed) => LlamaSampler::dist(seed),
        });
        Ok(LlamaCppSampler(LlamaSampler::chain_simple(chain)))
    }
}

/// Loaded llama.cpp weights. `LlamaModel` is already `Send + Sync`.
pub struct LlamaCppModel(LlamaModel);

impl NativeModel for LlamaCppModel {
    fn n_vocab(&self) -> usize {
        usize::try_from(self.0.n_vocab()).unwrap_or(0)
    }

    fn tokenize(&self, text: &str) -> Result<Vec<Token>, EngineError> {
        let tokens = self
            .0
            .str_to_token(text, AddBos::Always)
            .map_err(|e| EngineError::TokenizationFailed(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        self.0.is_eog_token(LlamaToken::new(token))
    }

    fn token_bytes(&self, token: Token) -> Result<Vec<u8>, EngineError> {
        self.0
            .token_to_bytes(LlamaToken::new(token), Special::Tokenize)
            .map_err(|e| EngineError::DecodeFailed(format!("Failed to convert token to bytes: {}", e)))
    }
}

/// llama.cpp decode context plus its reusable batch
pub struct LlamaCppContext {
    batch: LlamaBatch,
    ctx: LlamaContext<'static>,
    n_batch: usize,
    n_ctx: usize,
    n_past: usize,
    // Must stay below `ctx`: fields drop in declaration order.
    _model: Arc<ModelHandle<LlamaCppBackend>>,
}

// SAFETY: the engine only touches a context while holding its runtime
// mutex, so it moves between threads but is never used from two at once.
unsafe impl Send for LlamaCppContext {}

impl NativeContext for LlamaCppContext {
    fn decode(&mut self, tokens: &[Token]) -> Result<(), EngineError> {
        if self.n_past + tokens.len() > self.n_ctx {
            return Err(EngineError::DecodeFailed(format!(
                "context window exceeded: {} + {} > {}",
                self.n_past,
                tokens.len(),
                self.n_ctx
            )));
        }

        let last = tokens.len().saturating_sub(1);
        for (chunk_index, chunk) in tokens.chunks(self.n_batch).enumerate() {
            self.batch.clear();
            for (i, token) in chunk.iter().enumerate() {
                let index = chunk_index * self.n_batch + i;
                self.batch
                    .add(LlamaToken::new(*token), (self.n_past + i) as i32, &[0], index == last)
                    .map_err(|e| EngineError::DecodeFailed(format!("Failed to add token to batch: {}", e)))?;
            }

            self.ctx
                .decode(&mut self.batch)
                .map_err(|e| EngineError::DecodeFailed(e.to_string()))?;
            self.n_past += chunk.len();
        }
        Ok(())
    }

    fn clear_memory(&mut self) {
        self.ctx.clear_kv_cache();
        self.n_past = 0;
    }

    fn n_past(&self) -> usize {
        self.n_past
    }
}

/// llama.cpp sampler chain
pub struct LlamaCppSampler(LlamaSampler);

// SAFETY: same discipline as `LlamaCppContext`; guarded by the runtime mutex.
unsafe impl Send for LlamaCppSampler {}

impl NativeSampler<LlamaCppContext> for LlamaCppSampler {
    fn sample(&mut self, context: &LlamaCppContext) -> Token {
        self.0.sample(&context.ctx, -1).0
    }
}
