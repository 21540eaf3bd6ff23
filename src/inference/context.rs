//! Inference context
//!
//! Per-conversation decode state (the KV cache) bound to one model.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::inference::backend::{Backend, NativeContext, Token};
use crate::inference::engine::EngineError;
use crate::inference::model::ModelHandle;

/// Sizing of a decode context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Token capacity of the KV cache
    pub context_size: u32,
    /// Maximum tokens submitted in one decode call
    pub batch_size: u32,
    /// Threads used while generating (0 = library default)
    pub threads: i32,
    /// Threads used while processing the prompt (0 = library default)
    pub threads_batch: i32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_size: 4096,
            batch_size: 512,
            threads: 0,
            threads_batch: 0,
        }
    }
}

/// Exclusive owner of one native decode context.
///
/// Holds its own `Arc` of the model so the weights outlive the context even
/// if the registry releases them.
pub struct InferenceContext<B: Backend> {
    native: B::Context,
    model: Arc<ModelHandle<B>>,
    config: ContextConfig,
}

impl<B: Backend> InferenceContext<B> {
    /// Allocates a context for `model`. Nothing is retained on failure.
    pub fn create(model: &Arc<ModelHandle<B>>, config: &ContextConfig) -> Result<Self, EngineError> {
        if config.context_size == 0 || config.batch_size == 0 {
            return Err(EngineError::ContextCreateFailed(format!(
                "context size and batch size must be non-zero (got {} / {})",
                config.context_size, config.batch_size
            )));
        }

        let native = model.backend().new_context(model, config)?;
        tracing::debug!(
            "Context created: {} tokens, batch {}",
            config.context_size,
            config.batch_size
        );

        Ok(Self {
            native,
            model: Arc::clone(model),
            config: config.clone(),
        })
    }

    pub fn decode(&mut self, tokens: &[Token]) -> Result<(), EngineError> {
        self.native.decode(tokens)
    }

    /// Forgets every token decoded so far
    pub fn clear_memory(&mut self) {
        self.native.clear_memory();
    }

    pub fn n_past(&self) -> usize {
        self.native.n_past()
    }

    pub fn native(&self) -> &B::Context {
        &self.native
    }

    pub fn model(&self) -> &Arc<ModelHandle<B>> {
        &self.model
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }
}
