//! Scripted backend
//!
//! A weightless [`Backend`] that replays a fixed list of text pieces as its
//! output. Used by the test suite and by the demo binary's `--scripted` mode
//! to drive the engine without a GGUF file.
//!
//! Token ids `0..n` are the pieces, id `n` is the end-of-generation marker.
//! Tokenization emits one token per whitespace-separated word.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::inference::backend::{Backend, NativeContext, NativeModel, NativeSampler, Token};
use crate::inference::context::ContextConfig;
use crate::inference::engine::EngineError;
use crate::inference::model::{ModelConfig, ModelHandle};
use crate::inference::sampler::SamplingStage;
use crate::lock_unpoisoned;

pub struct ScriptedBackend {
    pieces: Arc<Vec<Vec<u8>>>,
    repeating: bool,
    decode_delay: Option<Duration>,
    fail_decode_on: Option<usize>,
    fail_load: bool,
    fail_tokenize: bool,
    prompt_log: Arc<Mutex<Vec<String>>>,
    sampler_stages: Mutex<Vec<SamplingStage>>,
    loads: AtomicUsize,
    decode_calls: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    /// Backend that answers every prompt with `pieces`, then stops.
    pub fn new<I, S>(pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_pieces(pieces.into_iter().map(|p| p.into().into_bytes()).collect())
    }

    /// Like [`new`](Self::new) with raw byte pieces, which need not be
    /// valid UTF-8 on their own.
    pub fn from_pieces(pieces: Vec<Vec<u8>>) -> Self {
        Self {
            pieces: Arc::new(pieces),
            repeating: false,
            decode_delay: None,
            fail_decode_on: None,
            fail_load: false,
            fail_tokenize: false,
            prompt_log: Arc::new(Mutex::new(Vec::new())),
            sampler_stages: Mutex::new(Vec::new()),
            loads: AtomicUsize::new(0),
            decode_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Cycle through the pieces forever instead of ending
    pub fn repeating(mut self) -> Self {
        self.repeating = true;
        self
    }

    /// Sleep this long in every decode call
    pub fn with_decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = Some(delay);
        self
    }

    /// Fail the `n`th decode call (1-based, counted across all contexts)
    pub fn fail_decode_on(mut self, n: usize) -> Self {
        self.fail_decode_on = Some(n);
        self
    }

    pub fn with_load_failure(mut self) -> Self {
        self.fail_load = true;
        self
    }

    /// Tokenize every text to nothing
    pub fn with_tokenize_failure(mut self) -> Self {
        self.fail_tokenize = true;
        self
    }

    /// Every text tokenized by models of this backend, in order
    pub fn prompt_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.prompt_log)
    }

    /// Stages passed to the most recent `new_sampler` call
    pub fn last_sampler_stages(&self) -> Vec<SamplingStage> {
        lock_unpoisoned(&self.sampler_stages).clone()
    }

    /// Number of successful model loads
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Acquire)
    }
}

impl Backend for ScriptedBackend {
    type Model = ScriptedModel;
    type Context = ScriptedContext;
    type Sampler = ScriptedSampler;

    fn load_model(&self, config: &ModelConfig) -> Result<ScriptedModel, EngineError> {
        if self.fail_load {
            return Err(EngineError::ModelLoadFailed(format!(
                "scripted load failure for {}",
                config.model_path.display()
            )));
        }

        self.loads.fetch_add(1, Ordering::AcqRel);
        Ok(ScriptedModel {
            pieces: Arc::clone(&self.pieces),
            fail_tokenize: self.fail_tokenize,
            prompt_log: Arc::clone(&self.prompt_log),
        })
    }

    fn new_context(
        &self,
        _model: &Arc<ModelHandle<Self>>,
        config: &ContextConfig,
    ) -> Result<ScriptedContext, EngineError> {
        Ok(ScriptedContext {
            n_past: 0,
            n_ctx: config.context_size as usize,
            delay: self.decode_delay,
            fail_on: self.fail_decode_on,
            calls: Arc::clone(&self.decode_calls),
        })
    }

    fn new_sampler(&self, stages: &[SamplingStage]) -> Result<ScriptedSampler, EngineError> {
        *lock_unpoisoned(&self.sampler_stages) = stages.to_vec();
        Ok(ScriptedSampler {
            len: self.pieces.len(),
            cursor: 0,
            repeating: self.repeating,
        })
    }
}

pub struct ScriptedModel {
    pieces: Arc<Vec<Vec<u8>>>,
    fail_tokenize: bool,
    prompt_log: Arc<Mutex<Vec<String>>>,
}

impl ScriptedModel {
    fn end_token(&self) -> Token {
        self.pieces.len() as Token
    }
}

impl NativeModel for ScriptedModel {
    fn n_vocab(&self) -> usize {
        self.pieces.len()
    }

    fn tokenize(&self, text: &str) -> Result<Vec<Token>, EngineError> {
        lock_unpoisoned(&self.prompt_log).push(text.to_string());
        if self.fail_tokenize {
            return Ok(Vec::new());
        }
        Ok(text.split_whitespace().map(|_| 0).collect())
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        token == self.end_token()
    }

    fn token_bytes(&self, token: Token) -> Result<Vec<u8>, EngineError> {
        usize::try_from(token)
            .ok()
            .and_then(|index| self.pieces.get(index))
            .cloned()
            .ok_or_else(|| EngineError::DecodeFailed(format!("token {token} is not in the script")))
    }
}

pub struct ScriptedContext {
    n_past: usize,
    n_ctx: usize,
    delay: Option<Duration>,
    fail_on: Option<usize>,
    calls: Arc<AtomicUsize>,
}

impl NativeContext for ScriptedContext {
    fn decode(&mut self, tokens: &[Token]) -> Result<(), EngineError> {
        let call = self.calls.fetch_add(1, Ordering::AcqRel) + 1;
        if self.fail_on == Some(call) {
            return Err(EngineError::DecodeFailed(format!("scripted failure on decode {call}")));
        }

        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }

        if self.n_past + tokens.len() > self.n_ctx {
            return Err(EngineError::DecodeFailed(format!(
                "context full: {} + {} > {}",
                self.n_past,
                tokens.len(),
                self.n_ctx
            )));
        }
        self.n_past += tokens.len();
        Ok(())
    }

    fn clear_memory(&mut self) {
        self.n_past = 0;
    }

    fn n_past(&self) -> usize {
        self.n_past
    }
}

/// Replays piece ids in order. A non-repeating script ends with the
/// end-of-generation id and restarts for the next request.
pub struct ScriptedSampler {
    len: usize,
    cursor: usize,
    repeating: bool,
}

impl NativeSampler<ScriptedContext> for ScriptedSampler {
    fn sample(&mut self, _context: &ScriptedContext) -> Token {
        if self.cursor >= self.len {
            self.cursor = 0;
            if !self.repeating || self.len == 0 {
                return self.len as Token;
            }
        }
        let token = self.cursor as Token;
        self.cursor += 1;
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(backend: &ScriptedBackend, n_ctx: u32) -> ScriptedContext {
        let model = Arc::new(
            ModelHandle::load(Arc::new(ScriptedBackend::new(["m"])), &ModelConfig::new("m.gguf")).unwrap(),
        );
        let config = ContextConfig {
            context_size: n_ctx,
            ..ContextConfig::default()
        };
        backend.new_context(&model, &config).unwrap()
    }

    #[test]
    fn test_sampler_replays_then_ends() {
        let backend = ScriptedBackend::new(["a", "b"]);
        let ctx = context(&backend, 16);
        let mut sampler = backend.new_sampler(&[SamplingStage::Distribution(0)]).unwrap();

        let drawn: Vec<Token> = (0..6).map(|_| sampler.sample(&ctx)).collect();
        assert_eq!(drawn, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_repeating_sampler_never_ends() {
        let backend = ScriptedBackend::new(["a", "b"]).repeating();
        let ctx = context(&backend, 16);
        let mut sampler = backend.new_sampler(&[SamplingStage::Distribution(0)]).unwrap();

        let drawn: Vec<Token> = (0..5).map(|_| sampler.sample(&ctx)).collect();
        assert_eq!(drawn, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_tokenize_counts_words_and_logs() {
        let backend = ScriptedBackend::new(["a"]);
        let log = backend.prompt_log();
        let model = backend.load_model(&ModelConfig::default()).unwrap();

        assert_eq!(model.tokenize("three little words").unwrap().len(), 3);
        assert_eq!(log.lock().unwrap().as_slice(), ["three little words"]);
        assert!(model.is_end_of_generation(1));
        assert!(model.token_bytes(1).is_err());
    }

    #[test]
    fn test_decode_failure_is_counted_across_calls() {
        let backend = ScriptedBackend::new(["a"]).fail_decode_on(2);
        let mut ctx = context(&backend, 16);

        assert!(ctx.decode(&[0]).is_ok());
        assert!(ctx.decode(&[0]).is_err());
        assert!(ctx.decode(&[0]).is_ok());
        assert_eq!(ctx.n_past(), 2);
    }
}
