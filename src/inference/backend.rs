//! Native backend traits
//!
//! The engine never talks to an inference library directly. A [`Backend`]
//! loads weights and builds per-engine contexts and samplers; the associated
//! types carry the actual native handles. `LlamaCppBackend` wraps llama.cpp,
//! `ScriptedBackend` replays a fixed token script without any weights.

use std::sync::Arc;

use crate::inference::context::ContextConfig;
use crate::inference::engine::EngineError;
use crate::inference::model::{ModelConfig, ModelHandle};
use crate::inference::sampler::SamplingStage;

/// Vocabulary token id
pub type Token = i32;

/// Factory for the three native resources a generation needs.
pub trait Backend: Send + Sync + Sized + 'static {
    /// Loaded weights and vocabulary. Shared read-only across threads.
    type Model: NativeModel;
    /// Per-conversation decode state (KV cache).
    type Context: NativeContext;
    /// Token-selection chain.
    type Sampler: NativeSampler<Self::Context>;

    /// Loads model weights from `config.model_path`.
    fn load_model(&self, config: &ModelConfig) -> Result<Self::Model, EngineError>;

    /// Allocates a decode context bound to `model`.
    ///
    /// The returned context may keep `model` alive for as long as it exists.
    fn new_context(
        &self,
        model: &Arc<ModelHandle<Self>>,
        config: &ContextConfig,
    ) -> Result<Self::Context, EngineError>;

    /// Builds a sampler chain applying `stages` in order.
    fn new_sampler(&self, stages: &[SamplingStage]) -> Result<Self::Sampler, EngineError>;
}

/// Read-only view of loaded weights and vocabulary.
pub trait NativeModel: Send + Sync + 'static {
    /// Number of entries in the vocabulary; zero means it failed to load.
    fn n_vocab(&self) -> usize;

    /// Converts text to tokens, parsing special markup tokens.
    fn tokenize(&self, text: &str) -> Result<Vec<Token>, EngineError>;

    /// True for any end-of-generation marker of this vocabulary.
    fn is_end_of_generation(&self, token: Token) -> bool;

    /// Raw bytes of a token's text piece. May be a partial UTF-8 sequence.
    fn token_bytes(&self, token: Token) -> Result<Vec<u8>, EngineError>;
}

/// Mutable decode state. Never used from two threads at once.
pub trait NativeContext: Send + 'static {
    /// Runs one forward pass over `tokens`, appending them after the
    /// tokens already held in memory.
    fn decode(&mut self, tokens: &[Token]) -> Result<(), EngineError>;

    /// Erases all cached key/value state.
    fn clear_memory(&mut self);

    /// Number of token positions currently held in memory.
    fn n_past(&self) -> usize;
}

/// Draws the next token from the logits of the last decode.
pub trait NativeSampler<C>: Send + 'static {
    fn sample(&mut self, context: &C) -> Token;
}
