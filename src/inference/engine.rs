//! Generation engine
//!
//! Runs the tokenize → decode → sample loop against one model, either on the
//! caller's thread or on a background thread per request, while keeping a
//! rolling chat history.
//!
//! # Locking
//!
//! Three independent mutexes:
//! - the runtime mutex owns the native context and sampler. Holding it *is*
//!   the single-flight guard: native contexts are not reentrant, so a second
//!   request on the same engine waits here until the first one has fired its
//!   end event and recorded its history entry.
//! - the task mutex guards the list of background join handles.
//! - the history mutex guards the chat log, so reading history never waits
//!   on a running generation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use uuid::Uuid;

use crate::inference::backend::{Backend, NativeModel};
use crate::inference::context::{ContextConfig, InferenceContext};
use crate::inference::model::ModelHandle;
use crate::inference::prompt::PromptFormatter;
use crate::inference::sampler::{Sampler, SamplingConfig};
use crate::inference::streaming::{StreamToken, TokenEvent, Utf8Accumulator};
use crate::lock_unpoisoned;
use crate::types::message::ChatMessage;

/// Errors that can occur while loading resources or generating text
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Engine not initialized")]
    NotInitialized,

    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("Failed to create context: {0}")]
    ContextCreateFailed(String),

    #[error("Failed to load vocabulary: {0}")]
    VocabLoadFailed(String),

    #[error("Failed to create sampler: {0}")]
    SamplerCreateFailed(String),

    #[error("Tokenization failed: {0}")]
    TokenizationFailed(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),
}

/// One prompt to answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Text appended to the history as the user turn
    pub prompt: String,
    /// Maximum number of tokens to produce
    pub max_tokens: u32,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens,
        }
    }
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            max_tokens: 128,
        }
    }
}

/// Why a run stopped producing tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// The model emitted an end-of-generation marker
    EndOfGeneration,
    /// The token budget ran out
    MaxTokens,
    /// `cancel_all_tasks` was observed
    Cancelled,
}

/// Output of a finished run
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub finish_reason: FinishReason,
    pub tokens_generated: usize,
}

/// Coarse lifecycle of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No model, context or sampler bound
    Uninitialized,
    /// Idle, accepts requests
    Ready,
    /// At least one request is queued or running
    Generating,
}

/// Per-token callback. Runs on the generating thread.
pub type TokenCallback = Box<dyn FnMut(&TokenEvent) + Send + 'static>;

/// Native state only touched while the runtime mutex is held
struct Runtime<B: Backend> {
    context: InferenceContext<B>,
    sampler: Sampler<B>,
}

struct Shared<B: Backend> {
    runtime: Mutex<Option<Runtime<B>>>,
    system_prompt: Mutex<String>,
    history: Mutex<Vec<ChatMessage>>,
    cancel: AtomicBool,
    initialized: AtomicBool,
    active: Arc<AtomicUsize>,
}

/// Counts a request as in flight until dropped
struct ActiveRun(Arc<AtomicUsize>);

impl ActiveRun {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Text generator bound to one shared model.
///
/// Every method takes `&self`, so an engine can sit behind an `Arc` and be
/// cancelled from another thread while `generate` blocks.
pub struct GenerationEngine<B: Backend> {
    shared: Arc<Shared<B>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: Backend> GenerationEngine<B> {
    /// Creates an uninitialized engine
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                runtime: Mutex::new(None),
                system_prompt: Mutex::new(String::new()),
                history: Mutex::new(Vec::new()),
                cancel: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                active: Arc::new(AtomicUsize::new(0)),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Binds the engine to `model` with a fresh context and sampler.
    ///
    /// On failure nothing is replaced: a fresh engine stays uninitialized,
    /// an initialized one keeps its previous context.
    pub fn initialize_with_model(
        &self,
        model: Arc<ModelHandle<B>>,
        context_config: &ContextConfig,
        sampling_config: &SamplingConfig,
        system_prompt: impl Into<String>,
    ) -> Result<(), EngineError> {
        let context = InferenceContext::create(&model, context_config)?;
        let sampler = Sampler::create(model.backend().as_ref(), sampling_config)?;

        let mut runtime = lock_unpoisoned(&self.shared.runtime);
        *runtime = Some(Runtime { context, sampler });
        *lock_unpoisoned(&self.shared.system_prompt) = system_prompt.into();
        self.shared.initialized.store(true, Ordering::Release);

        tracing::info!(
            "GenerationEngine initialized with {} ({} token context)",
            model.path().display(),
            context_config.context_size
        );
        Ok(())
    }

    /// Answers `request` on the calling thread.
    ///
    /// Blocks for the whole decode loop, including any wait for another run
    /// on this engine to finish.
    pub fn generate(&self, request: GenerationRequest) -> Result<Generation, EngineError> {
        self.ensure_ready()?;
        self.push_history(ChatMessage::user(request.prompt.as_str()));

        let _active = ActiveRun::enter(&self.shared.active);
        run_generation(&self.shared, &request, &mut None)
    }

    /// Answers `request` on a new background thread.
    ///
    /// `on_token` receives one event per produced fragment and exactly one
    /// final event with `is_end == true`, also when the run is cancelled or
    /// fails. The callback must not call back into this engine.
    pub fn generate_async<F>(&self, request: GenerationRequest, on_token: F) -> Result<(), EngineError>
    where
        F: FnMut(&TokenEvent) + Send + 'static,
    {
        self.ensure_ready()?;
        self.push_history(ChatMessage::user(request.prompt.as_str()));

        let shared = Arc::clone(&self.shared);
        let active = ActiveRun::enter(&self.shared.active);
        let mut callback: Option<TokenCallback> = Some(Box::new(on_token));

        let mut tasks = lock_unpoisoned(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(thread::spawn(move || {
            let _active = active;
            // Failures already reach the callback as the end event.
            let _ = run_generation(&shared, &request, &mut callback);
        }));
        Ok(())
    }

    /// Like [`generate_async`](Self::generate_async), delivering events over
    /// a channel for async consumers.
    pub fn generate_stream(
        &self,
        request: GenerationRequest,
    ) -> Result<UnboundedReceiver<StreamToken>, EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.generate_async(request, move |event| {
            // A dropped receiver just means nobody is listening any more.
            let _ = tx.send(StreamToken::from(event));
        })?;
        Ok(rx)
    }

    /// Asks every running generation to stop at its next decode step.
    ///
    /// Does not block. The flag stays set until [`wait_all_tasks`](Self::wait_all_tasks).
    pub fn cancel_all_tasks(&self) {
        self.shared.cancel.store(true, Ordering::Release);
        tracing::debug!("Cancellation requested");
    }

    /// Joins every background generation, then clears the cancel flag.
    ///
    /// The task list is only locked while it is taken, so new requests can
    /// be queued while this waits.
    pub fn wait_all_tasks(&self) {
        let tasks = std::mem::take(&mut *lock_unpoisoned(&self.tasks));
        for task in tasks {
            if task.join().is_err() {
                tracing::warn!("Generation task panicked");
            }
        }
        self.shared.cancel.store(false, Ordering::Release);
    }

    /// Erases the model's KV cache.
    ///
    /// The textual chat history is kept, so the next prompt replays the full
    /// history into an empty cache.
    pub fn reset_context(&self) -> Result<(), EngineError> {
        self.ensure_ready()?;

        let mut runtime = lock_unpoisoned(&self.shared.runtime);
        let runtime = runtime.as_mut().ok_or(EngineError::NotInitialized)?;
        runtime.context.clear_memory();

        tracing::info!("Context memory cleared");
        Ok(())
    }

    /// Empties the chat history; the model's cache is left alone.
    pub fn clear_chat_history(&self) {
        lock_unpoisoned(&self.shared.history).clear();
        tracing::debug!("Chat history cleared");
    }

    /// Snapshot of the chat history
    pub fn chat_history(&self) -> Vec<ChatMessage> {
        lock_unpoisoned(&self.shared.history).clone()
    }

    pub fn system_prompt(&self) -> String {
        lock_unpoisoned(&self.shared.system_prompt).clone()
    }

    /// Token positions currently held in the context.
    ///
    /// Waits for any running generation.
    pub fn context_tokens(&self) -> Option<usize> {
        lock_unpoisoned(&self.shared.runtime)
            .as_ref()
            .map(|runtime| runtime.context.n_past())
    }

    /// Model this engine is bound to. Waits for any running generation.
    pub fn model(&self) -> Option<Arc<ModelHandle<B>>> {
        lock_unpoisoned(&self.shared.runtime)
            .as_ref()
            .map(|runtime| Arc::clone(runtime.context.model()))
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
    }

    pub fn state(&self) -> EngineState {
        if !self.is_initialized() {
            EngineState::Uninitialized
        } else if self.shared.active.load(Ordering::Acquire) > 0 {
            EngineState::Generating
        } else {
            EngineState::Ready
        }
    }

    fn ensure_ready(&self) -> Result<(), EngineError> {
        if self.is_initialized() {
            Ok(())
        } else {
            tracing::warn!("Generation requested before the engine was initialized");
            Err(EngineError::NotInitialized)
        }
    }

    fn push_history(&self, message: ChatMessage) {
        lock_unpoisoned(&self.shared.history).push(message);
    }
}

impl<B: Backend> Default for GenerationEngine<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Drop for GenerationEngine<B> {
    fn drop(&mut self) {
        self.cancel_all_tasks();
        self.wait_all_tasks();
    }
}

/// One full run under the runtime mutex: loop, end event, history entry.
fn run_generation<B: Backend>(
    shared: &Shared<B>,
    request: &GenerationRequest,
    on_token: &mut Option<TokenCallback>,
) -> Result<Generation, EngineError> {
    let run_id = Uuid::new_v4();
    let span = tracing::debug_span!("generation", %run_id);
    let _enter = span.enter();

    let mut runtime = lock_unpoisoned(&shared.runtime);
    let started = Instant::now();
    let mut text = String::new();

    let outcome = match runtime.as_mut() {
        Some(runtime) => decode_loop(shared, runtime, request, &mut text, on_token),
        None => Err(EngineError::NotInitialized),
    };

    if let Some(callback) = on_token.as_mut() {
        callback(&TokenEvent::end(&text, &outcome));
    }

    match outcome {
        Ok((finish_reason, tokens_generated)) => {
            lock_unpoisoned(&shared.history).push(ChatMessage::assistant(text.as_str()));

            let elapsed = started.elapsed().as_secs_f64();
            tracing::debug!(
                "Generated {} tokens in {:.2}s ({:.1} tok/s), {:?}",
                tokens_generated,
                elapsed,
                tokens_generated as f64 / elapsed.max(f64::EPSILON),
                finish_reason
            );

            Ok(Generation {
                text,
                finish_reason,
                tokens_generated,
            })
        }
        Err(e) => {
            tracing::warn!("Generation failed: {}", e);
            Err(e)
        }
    }
}

/// The decode/sample loop. Writes produced text into `text` as it goes so a
/// failure part way through still leaves the partial output with the caller.
fn decode_loop<B: Backend>(
    shared: &Shared<B>,
    runtime: &mut Runtime<B>,
    request: &GenerationRequest,
    text: &mut String,
    on_token: &mut Option<TokenCallback>,
) -> Result<(FinishReason, usize), EngineError> {
    let prompt = {
        let system_prompt = lock_unpoisoned(&shared.system_prompt);
        let history = lock_unpoisoned(&shared.history);
        PromptFormatter::generation_prompt(&system_prompt, &history)
    };

    let model = Arc::clone(runtime.context.model());
    let prompt_tokens = model.native().tokenize(&prompt)?;
    if prompt_tokens.is_empty() {
        return Err(EngineError::TokenizationFailed(
            "prompt produced no tokens".to_string(),
        ));
    }
    tracing::debug!("Tokenized prompt into {} tokens", prompt_tokens.len());

    let budget = prompt_tokens.len() + request.max_tokens as usize;
    let mut batch = prompt_tokens;
    let mut processed = 0usize;
    let mut produced = 0usize;
    let mut pending = Utf8Accumulator::default();
    let mut finish_reason = FinishReason::MaxTokens;

    // The first pass decodes the whole prompt, every later pass one token.
    while processed + batch.len() < budget {
        if shared.cancel.load(Ordering::Acquire) {
            tracing::debug!("Generation cancelled after {} tokens", produced);
            finish_reason = FinishReason::Cancelled;
            break;
        }

        runtime.context.decode(&batch)?;
        processed += batch.len();

        let token = runtime.sampler.sample(&runtime.context);
        if model.native().is_end_of_generation(token) {
            finish_reason = FinishReason::EndOfGeneration;
            break;
        }
        produced += 1;

        let bytes = model.native().token_bytes(token)?;
        emit(text, pending.push(&bytes), on_token);

        batch.clear();
        batch.push(token);
    }

    emit(text, pending.flush(), on_token);
    Ok((finish_reason, produced))
}

fn emit(text: &mut String, fragment: String, on_token: &mut Option<TokenCallback>) {
    if fragment.is_empty() {
        return;
    }
    text.push_str(&fragment);
    if let Some(callback) = on_token.as_mut() {
        callback(&TokenEvent::token(fragment, text.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::model::ModelConfig;
    use crate::inference::scripted::ScriptedBackend;
    use crate::types::message::ChatRole;
    use std::time::Duration;

    fn engine_with(backend: ScriptedBackend, system_prompt: &str) -> GenerationEngine<ScriptedBackend> {
        let model = Arc::new(
            ModelHandle::load(Arc::new(backend), &ModelConfig::new("scripted.gguf")).unwrap(),
        );
        let engine = GenerationEngine::new();
        engine
            .initialize_with_model(
                model,
                &ContextConfig::default(),
                &SamplingConfig::default(),
                system_prompt,
            )
            .unwrap();
        engine
    }

    fn collecting_callback() -> (Arc<Mutex<Vec<TokenEvent>>>, impl FnMut(&TokenEvent) + Send + 'static) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, move |event: &TokenEvent| sink.lock().unwrap().push(event.clone()))
    }

    #[test]
    fn test_engine_new() {
        let engine = GenerationEngine::<ScriptedBackend>::new();
        assert!(!engine.is_initialized());
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert!(engine.chat_history().is_empty());
        assert!(engine.context_tokens().is_none());
        assert!(engine.model().is_none());
    }

    #[test]
    fn test_initialize_builds_sampler_from_config() {
        let backend = Arc::new(ScriptedBackend::new(["a"]));
        let model = Arc::new(ModelHandle::load(Arc::clone(&backend), &ModelConfig::new("m.gguf")).unwrap());
        let sampling = SamplingConfig {
            top_k: 5,
            top_p: 0.5,
            temperature: 0.2,
            seed: 11,
        };

        let engine = GenerationEngine::new();
        engine
            .initialize_with_model(model, &ContextConfig::default(), &sampling, "")
            .unwrap();

        assert_eq!(backend.last_sampler_stages(), sampling.stages().to_vec());
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[test]
    fn test_requests_can_queue_while_waiting() {
        let backend = ScriptedBackend::new(["w"])
            .repeating()
            .with_decode_delay(Duration::from_millis(2));
        let engine = Arc::new(engine_with(backend, ""));

        engine
            .generate_async(GenerationRequest::new("long", 10_000), |_: &TokenEvent| {})
            .unwrap();
        let waiter = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.wait_all_tasks())
        };
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        engine
            .generate_async(GenerationRequest::new("short", 3), |_: &TokenEvent| {})
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        engine.cancel_all_tasks();
        waiter.join().unwrap();
        engine.wait_all_tasks();
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[test]
    fn test_engine_reports_bound_model() {
        let engine = engine_with(ScriptedBackend::new(["a"]), "");
        let model = engine.model().unwrap();
        assert_eq!(model.path(), std::path::Path::new("scripted.gguf"));
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[test]
    fn test_generate_before_init_fails_fast() {
        let engine = GenerationEngine::<ScriptedBackend>::new();
        let result = engine.generate(GenerationRequest::new("hello", 10));
        assert_eq!(result, Err(EngineError::NotInitialized));
        assert!(engine.chat_history().is_empty());

        let (events, callback) = collecting_callback();
        let result = engine.generate_async(GenerationRequest::new("hello", 10), callback);
        assert_eq!(result, Err(EngineError::NotInitialized));
        engine.wait_all_tasks();
        assert!(events.lock().unwrap().is_empty());

        assert_eq!(engine.reset_context(), Err(EngineError::NotInitialized));
    }

    #[test]
    fn test_failed_init_leaves_engine_uninitialized() {
        let backend = Arc::new(ScriptedBackend::new(["a"]));
        let model = Arc::new(ModelHandle::load(backend, &ModelConfig::new("m.gguf")).unwrap());
        let engine = GenerationEngine::new();

        let bad_context = ContextConfig {
            batch_size: 0,
            ..ContextConfig::default()
        };
        let result = engine.initialize_with_model(model, &bad_context, &SamplingConfig::default(), "");
        assert!(matches!(result, Err(EngineError::ContextCreateFailed(_))));
        assert_eq!(engine.state(), EngineState::Uninitialized);
    }

    #[test]
    fn test_generate_scripted_tokens() {
        let engine = engine_with(ScriptedBackend::new(["Hello", ",", " world"]), "");

        let generation = engine.generate(GenerationRequest::new("hello", 10)).unwrap();
        assert_eq!(generation.text, "Hello, world");
        assert_eq!(generation.finish_reason, FinishReason::EndOfGeneration);
        assert_eq!(generation.tokens_generated, 3);

        let history = engine.chat_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, ChatRole::User);
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[1].role, ChatRole::Assistant);
        assert_eq!(history[1].content, "Hello, world");
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[test]
    fn test_token_budget_limits_output() {
        let engine = engine_with(ScriptedBackend::new(["a", "b"]).repeating(), "");

        let generation = engine.generate(GenerationRequest::new("go", 5)).unwrap();
        assert_eq!(generation.text, "ababa");
        assert_eq!(generation.tokens_generated, 5);
        assert_eq!(generation.finish_reason, FinishReason::MaxTokens);
    }

    #[test]
    fn test_zero_budget_produces_empty_entry() {
        let engine = engine_with(ScriptedBackend::new(["a"]).repeating(), "");

        let generation = engine.generate(GenerationRequest::new("go", 0)).unwrap();
        assert_eq!(generation.text, "");
        assert_eq!(generation.finish_reason, FinishReason::MaxTokens);
        assert_eq!(engine.chat_history().last().unwrap().content, "");
    }

    #[test]
    fn test_prompt_includes_system_and_history() {
        let backend = ScriptedBackend::new(["Hi"]);
        let prompts = backend.prompt_log();
        let engine = engine_with(backend, "You are Mira.");

        engine.generate(GenerationRequest::new("first", 10)).unwrap();
        engine.generate(GenerationRequest::new("second", 10)).unwrap();

        let prompt = prompts.lock().unwrap().last().cloned().unwrap();
        assert!(prompt.starts_with("<|im_start|>system\nYou are Mira.\n<|im_end|>"));
        assert!(prompt.contains("<|im_start|>user\nfirst\n<|im_end|>"));
        assert!(prompt.contains("<|im_start|>assistant\nHi\n<|im_end|>"));
        assert!(prompt.ends_with("<|im_start|>user\nsecond\n<|im_end|>\n<|im_start|>assistant\n"));
        assert_eq!(engine.system_prompt(), "You are Mira.");
    }

    #[test]
    fn test_async_callbacks_in_order_with_single_end() {
        let engine = engine_with(ScriptedBackend::new(["one", " two", " three"]), "");
        let (events, callback) = collecting_callback();

        engine
            .generate_async(GenerationRequest::new("count", 10), callback)
            .unwrap();
        engine.wait_all_tasks();

        let events = events.lock().unwrap();
        let fragments: Vec<&str> = events.iter().filter(|e| !e.is_end).map(|e| e.token.as_str()).collect();
        assert_eq!(fragments, vec!["one", " two", " three"]);
        assert_eq!(events[1].generated_text, "one two");

        assert_eq!(events.iter().filter(|e| e.is_end).count(), 1);
        let end = events.last().unwrap();
        assert!(end.is_end);
        assert_eq!(end.token, "");
        assert_eq!(end.generated_text, "one two three");
        assert_eq!(end.finish_reason, Some(FinishReason::EndOfGeneration));
        assert!(end.error.is_none());
    }

    #[test]
    fn test_cancel_stops_async_generation_early() {
        let backend = ScriptedBackend::new(["x"])
            .repeating()
            .with_decode_delay(Duration::from_millis(2));
        let engine = engine_with(backend, "");
        let (events, callback) = collecting_callback();

        engine
            .generate_async(GenerationRequest::new("never stop", 10_000), callback)
            .unwrap();
        engine.cancel_all_tasks();
        engine.wait_all_tasks();

        let events = events.lock().unwrap();
        let end = events.last().unwrap();
        assert!(end.is_end);
        assert_eq!(end.finish_reason, Some(FinishReason::Cancelled));
        assert_eq!(events.iter().filter(|e| e.is_end).count(), 1);
        assert!(events.len() < 10_000);

        let history = engine.chat_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, ChatRole::Assistant);
        assert_eq!(history[1].content, end.generated_text);
    }

    #[test]
    fn test_wait_clears_cancel_flag() {
        let engine = engine_with(ScriptedBackend::new(["a", "b"]), "");

        engine.cancel_all_tasks();
        let cancelled = engine.generate(GenerationRequest::new("early", 10)).unwrap();
        assert_eq!(cancelled.finish_reason, FinishReason::Cancelled);
        assert_eq!(cancelled.text, "");

        engine.wait_all_tasks();
        let generation = engine.generate(GenerationRequest::new("later", 10)).unwrap();
        assert_eq!(generation.finish_reason, FinishReason::EndOfGeneration);
        assert_eq!(generation.text, "ab");
    }

    #[test]
    fn test_cancel_from_other_thread_during_sync_generate() {
        let backend = ScriptedBackend::new(["z"])
            .repeating()
            .with_decode_delay(Duration::from_millis(2));
        let engine = Arc::new(engine_with(backend, ""));

        let canceller = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                engine.cancel_all_tasks();
            })
        };

        let generation = engine.generate(GenerationRequest::new("long", 100_000)).unwrap();
        canceller.join().unwrap();
        assert_eq!(generation.finish_reason, FinishReason::Cancelled);
        assert!(generation.tokens_generated < 100_000);
        engine.wait_all_tasks();
    }

    #[test]
    fn test_concurrent_async_runs_do_not_interleave() {
        let backend = ScriptedBackend::new(["a", "b", "c"]).with_decode_delay(Duration::from_millis(1));
        let engine = engine_with(backend, "");
        let log: Arc<Mutex<Vec<(u8, bool)>>> = Arc::new(Mutex::new(Vec::new()));

        for run in 0..2u8 {
            let log = Arc::clone(&log);
            engine
                .generate_async(GenerationRequest::new("go", 10), move |event: &TokenEvent| {
                    log.lock().unwrap().push((run, event.is_end));
                })
                .unwrap();
        }
        engine.wait_all_tasks();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 8);
        let first_run = log[0].0;
        assert!(log[..4].iter().all(|(run, _)| *run == first_run));
        assert!(log[3].1);
        assert!(log[4..].iter().all(|(run, _)| *run != first_run));
        assert!(log[7].1);
    }

    #[test]
    fn test_reset_context_keeps_history() {
        let engine = engine_with(ScriptedBackend::new(["ok"]), "");
        engine.generate(GenerationRequest::new("remember me", 10)).unwrap();
        assert!(engine.context_tokens().unwrap() > 0);

        engine.reset_context().unwrap();
        assert_eq!(engine.context_tokens(), Some(0));
        assert_eq!(engine.chat_history().len(), 2);
    }

    #[test]
    fn test_clear_chat_history_keeps_context() {
        let engine = engine_with(ScriptedBackend::new(["ok"]), "");
        engine.generate(GenerationRequest::new("hi", 10)).unwrap();
        let cached = engine.context_tokens().unwrap();

        engine.clear_chat_history();
        assert!(engine.chat_history().is_empty());
        assert_eq!(engine.context_tokens(), Some(cached));
    }

    #[test]
    fn test_decode_failure_leaves_engine_usable() {
        let engine = engine_with(ScriptedBackend::new(["a", "b"]).fail_decode_on(2), "");

        let result = engine.generate(GenerationRequest::new("first", 10));
        assert!(matches!(result, Err(EngineError::DecodeFailed(_))));
        assert_eq!(engine.state(), EngineState::Ready);
        // Failed runs record no assistant turn.
        assert_eq!(engine.chat_history().len(), 1);

        let generation = engine.generate(GenerationRequest::new("second", 10)).unwrap();
        assert_eq!(generation.finish_reason, FinishReason::EndOfGeneration);
    }

    #[test]
    fn test_async_failure_still_fires_end_event() {
        let engine = engine_with(ScriptedBackend::new(["a", "b"]).fail_decode_on(2), "");
        let (events, callback) = collecting_callback();

        engine.generate_async(GenerationRequest::new("x", 10), callback).unwrap();
        engine.wait_all_tasks();

        let events = events.lock().unwrap();
        let end = events.last().unwrap();
        assert!(end.is_end);
        assert_eq!(end.generated_text, "a");
        assert!(matches!(end.error, Some(EngineError::DecodeFailed(_))));
        assert_eq!(end.finish_reason, None);
    }

    #[test]
    fn test_tokenization_failure() {
        let engine = engine_with(ScriptedBackend::new(["a"]).with_tokenize_failure(), "");
        let result = engine.generate(GenerationRequest::new("x", 10));
        assert!(matches!(result, Err(EngineError::TokenizationFailed(_))));
    }

    #[test]
    fn test_split_utf8_is_reassembled() {
        let backend = ScriptedBackend::from_pieces(vec![b"caf".to_vec(), vec![0xC3], vec![0xA9], b"!".to_vec()]);
        let engine = engine_with(backend, "");
        let (events, callback) = collecting_callback();

        engine.generate_async(GenerationRequest::new("order", 10), callback).unwrap();
        engine.wait_all_tasks();

        let events = events.lock().unwrap();
        let fragments: Vec<&str> = events.iter().filter(|e| !e.is_end).map(|e| e.token.as_str()).collect();
        assert_eq!(fragments, vec!["caf", "é", "!"]);
        assert_eq!(events.last().unwrap().generated_text, "café!");
    }

    #[test]
    fn test_state_reports_generating() {
        let backend = ScriptedBackend::new(["s"])
            .repeating()
            .with_decode_delay(Duration::from_millis(2));
        let engine = engine_with(backend, "");

        engine
            .generate_async(GenerationRequest::new("spin", 10_000), |_: &TokenEvent| {})
            .unwrap();
        assert_eq!(engine.state(), EngineState::Generating);

        engine.cancel_all_tasks();
        engine.wait_all_tasks();
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[tokio::test]
    async fn test_generate_stream() {
        let engine = engine_with(ScriptedBackend::new(["to", "ken"]), "");
        let mut rx = engine.generate_stream(GenerationRequest::new("stream", 10)).unwrap();

        let mut tokens = Vec::new();
        let mut done = None;
        while let Some(item) = rx.recv().await {
            match item {
                StreamToken::Token(t) => tokens.push(t),
                StreamToken::Done { text, finish_reason } => done = Some((text, finish_reason)),
                StreamToken::Error(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(tokens, vec!["to", "ken"]);
        assert_eq!(done, Some(("token".to_string(), FinishReason::EndOfGeneration)));
        engine.wait_all_tasks();
    }
}
