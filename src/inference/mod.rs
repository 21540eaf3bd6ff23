//! LLM inference
//!
//! Model loading, per-engine decode state, sampling and the generation loop.
//! Everything is generic over a [`Backend`]; llama.cpp is the production
//! backend, [`ScriptedBackend`] the weightless one.

pub mod backend;
pub mod context;
pub mod engine;
#[cfg(feature = "llama")]
pub mod llama;
pub mod model;
pub mod prompt;
pub mod registry;
pub mod sampler;
pub mod scripted;
pub mod streaming;

pub use backend::{Backend, NativeContext, NativeModel, NativeSampler, Token};
pub use context::{ContextConfig, InferenceContext};
pub use engine::{
    EngineError, EngineState, FinishReason, Generation, GenerationEngine, GenerationRequest,
    TokenCallback,
};
#[cfg(feature = "llama")]
pub use llama::{LlamaCppBackend, LlamaEngine, LlamaModelRegistry};
pub use model::{validate_gguf, GgufHeader, ModelConfig, ModelError, ModelHandle, GGUF_MAGIC};
pub use prompt::PromptFormatter;
pub use registry::ModelRegistry;
pub use sampler::{Sampler, SamplingConfig, SamplingStage, DEFAULT_SEED};
pub use scripted::ScriptedBackend;
pub use streaming::{StreamToken, StreamingTextSink, TokenEvent};
