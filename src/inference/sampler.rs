//! Token sampling
//!
//! The chain is always, in this order:
//!
//! ```text
//! logits ─► top-k ─► top-p ─► temperature ─► categorical draw ─► token
//! ```
//!
//! Reordering the stages changes the output distribution for the same seed,
//! so the order is fixed here rather than left to callers.

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use crate::inference::backend::{Backend, NativeSampler, Token};
use crate::inference::context::InferenceContext;
use crate::inference::engine::EngineError;

/// Seed value meaning "pick a fresh random seed" (llama.cpp's `LLAMA_DEFAULT_SEED`)
pub const DEFAULT_SEED: u32 = u32::MAX;

/// Sampling parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Keep only the k most likely tokens
    pub top_k: i32,
    /// Keep the smallest set of tokens whose probability mass reaches p
    pub top_p: f32,
    /// Logit temperature (lower = more deterministic)
    pub temperature: f32,
    /// Seed of the final draw
    pub seed: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            top_k: 40,
            top_p: 0.9,
            temperature: 0.7,
            seed: DEFAULT_SEED,
        }
    }
}

impl SamplingConfig {
    /// The sampler chain for these parameters, in application order
    pub fn stages(&self) -> [SamplingStage; 4] {
        [
            SamplingStage::TopK(self.top_k),
            SamplingStage::TopP(self.top_p),
            SamplingStage::Temperature(self.temperature),
            SamplingStage::Distribution(self.seed),
        ]
    }
}

/// One transform of the sampler chain
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingStage {
    TopK(i32),
    TopP(f32),
    Temperature(f32),
    /// Final categorical draw with the given seed
    Distribution(u32),
}

/// Exclusive owner of one native sampler chain
pub struct Sampler<B: Backend> {
    native: B::Sampler,
    config: SamplingConfig,
    _backend: PhantomData<fn() -> B>,
}

impl<B: Backend> Sampler<B> {
    pub fn create(backend: &B, config: &SamplingConfig) -> Result<Self, EngineError> {
        let stages = config.stages();
        check_chain(&stages)?;

        let native = backend.new_sampler(&stages)?;
        tracing::debug!(
            "Sampler created: top_k={} top_p={} temp={} seed={}",
            config.top_k,
            config.top_p,
            config.temperature,
            config.seed
        );

        Ok(Self {
            native,
            config: config.clone(),
            _backend: PhantomData,
        })
    }

    /// Draws the next token from the context's most recent logits
    pub fn sample(&mut self, context: &InferenceContext<B>) -> Token {
        self.native.sample(context.native())
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }
}

/// A chain must draw a token at the end, and only there.
pub(crate) fn check_chain(stages: &[SamplingStage]) -> Result<(), EngineError> {
    match stages.split_last() {
        Some((SamplingStage::Distribution(_), rest))
            if !rest.iter().any(|s| matches!(s, SamplingStage::Distribution(_))) =>
        {
            Ok(())
        }
        Some(_) => Err(EngineError::SamplerCreateFailed(
            "sampler chain must end with exactly one distribution draw".to_string(),
        )),
        None => Err(EngineError::SamplerCreateFailed(
            "sampler chain is empty".to_string(),
        )),
    }
}
