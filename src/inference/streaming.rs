//! Streaming inference support
//!
//! Per-token events from a background generation, and the two ways of
//! consuming them: [`StreamingTextSink`] for a UI loop that polls once per
//! frame, and [`StreamToken`] for async consumers reading a channel.

use std::char::REPLACEMENT_CHARACTER;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::inference::backend::Backend;
use crate::inference::engine::{EngineError, FinishReason, GenerationEngine, GenerationRequest};
use crate::lock_unpoisoned;

/// Callback payload for one step of a generation
#[derive(Debug, Clone, PartialEq)]
pub struct TokenEvent {
    /// Newly produced text; empty on the end event
    pub token: String,
    /// Everything produced so far in this run
    pub generated_text: String,
    /// Set on the last event of a run, and only there
    pub is_end: bool,
    /// End event only: why the run stopped, `None` if it failed
    pub finish_reason: Option<FinishReason>,
    /// End event only: the failure that aborted the run
    pub error: Option<EngineError>,
}

impl TokenEvent {
    pub(crate) fn token(token: String, generated_text: String) -> Self {
        Self {
            token,
            generated_text,
            is_end: false,
            finish_reason: None,
            error: None,
        }
    }

    pub(crate) fn end(generated_text: &str, outcome: &Result<(FinishReason, usize), EngineError>) -> Self {
        let (finish_reason, error) = match outcome {
            Ok((reason, _)) => (Some(*reason), None),
            Err(e) => (None, Some(e.clone())),
        };
        Self {
            token: String::new(),
            generated_text: generated_text.to_string(),
            is_end: true,
            finish_reason,
            error,
        }
    }
}

/// Represents a token emitted during streaming inference.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamToken {
    /// A generated text fragment
    Token(String),
    /// Generation finished; carries the authoritative full text
    Done {
        text: String,
        finish_reason: FinishReason,
    },
    /// Generation aborted
    Error(EngineError),
}

impl StreamToken {
    pub fn is_token(&self) -> bool {
        matches!(self, StreamToken::Token(_))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamToken::Done { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamToken::Error(_))
    }

    /// Extracts the fragment if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&TokenEvent> for StreamToken {
    fn from(event: &TokenEvent) -> Self {
        if !event.is_end {
            return StreamToken::Token(event.token.clone());
        }
        match (&event.error, event.finish_reason) {
            (Some(e), _) => StreamToken::Error(e.clone()),
            (None, Some(finish_reason)) => StreamToken::Done {
                text: event.generated_text.clone(),
                finish_reason,
            },
            (None, None) => StreamToken::Error(EngineError::DecodeFailed(
                "generation ended without a result".to_string(),
            )),
        }
    }
}

/// Holds back incomplete UTF-8 sequences until the rest of the character
/// arrives. A token piece may end in the middle of a multibyte character.
#[derive(Debug, Default)]
pub(crate) struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    /// Adds `bytes` and returns whatever now forms complete characters.
    /// Bytes that can never become valid are replaced with U+FFFD.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match e.error_len() {
                        Some(invalid) => {
                            out.push(REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + invalid);
                        }
                        None => {
                            self.pending.drain(..valid_up_to);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Drains anything still held, lossily.
    pub(crate) fn flush(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[derive(Debug, Default)]
struct SinkState {
    text: Mutex<String>,
    /// Id of the run allowed to write; bumped under the `text` lock
    run: AtomicU64,
    complete: AtomicBool,
    generating: AtomicBool,
    last_error: Mutex<Option<EngineError>>,
}

/// Text buffer filled by a background generation and polled by the UI.
///
/// The state lives behind an `Arc` that the generation callback also holds,
/// so dropping the sink mid-generation is safe: the callback keeps writing
/// into state nobody reads any more, and it is freed when the run ends.
#[derive(Debug, Default)]
pub struct StreamingTextSink {
    state: Arc<SinkState>,
}

impl StreamingTextSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a background generation writing into this sink.
    ///
    /// Any generation already running on `engine` is cancelled and joined
    /// first. A run started earlier on another engine is not stopped, but
    /// from here on its events are ignored, so a sink never shows tokens
    /// from two runs mixed together.
    pub fn start_generation<B: Backend>(
        &self,
        engine: &GenerationEngine<B>,
        request: GenerationRequest,
    ) -> Result<(), EngineError> {
        engine.cancel_all_tasks();
        engine.wait_all_tasks();

        let run = {
            let mut text = lock_unpoisoned(&self.state.text);
            text.clear();
            *lock_unpoisoned(&self.state.last_error) = None;
            self.state.complete.store(false, Ordering::Release);
            self.state.generating.store(true, Ordering::Release);
            self.state.run.fetch_add(1, Ordering::AcqRel) + 1
        };

        let state = Arc::clone(&self.state);
        let started = engine.generate_async(request, move |event: &TokenEvent| {
            let mut text = lock_unpoisoned(&state.text);
            if state.run.load(Ordering::Acquire) != run {
                return;
            }

            if event.is_end {
                *text = event.generated_text.clone();
                *lock_unpoisoned(&state.last_error) = event.error.clone();
                state.complete.store(true, Ordering::Release);
                state.generating.store(false, Ordering::Release);
            } else {
                text.push_str(&event.token);
            }
        });

        if let Err(e) = &started {
            self.state.generating.store(false, Ordering::Release);
            *lock_unpoisoned(&self.state.last_error) = Some(e.clone());
        }
        started
    }

    /// Snapshot of the text so far; partial while a generation runs
    pub fn text(&self) -> String {
        lock_unpoisoned(&self.state.text).clone()
    }

    pub fn is_generation_complete(&self) -> bool {
        self.state.complete.load(Ordering::Acquire)
    }

    pub fn is_generating(&self) -> bool {
        self.state.generating.load(Ordering::Acquire)
    }

    /// Error of the last generation, if it failed or could not start
    pub fn last_error(&self) -> Option<EngineError> {
        lock_unpoisoned(&self.state.last_error).clone()
    }

    /// Resets text and flags. Does not stop a running generation.
    pub fn clear_buffer(&self) {
        lock_unpoisoned(&self.state.text).clear();
        *lock_unpoisoned(&self.state.last_error) = None;
        self.state.complete.store(false, Ordering::Release);
        self.state.generating.store(false, Ordering::Release);
    }
}
