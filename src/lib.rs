//! novel-llm
//!
//! Local LLM inference orchestration: shared model registry, per-engine
//! generation on background threads, and a polled streaming text sink.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod inference;
pub mod storage;
pub mod types;

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// A panicking token callback must not wedge the engine for every later
/// request, so poisoning is ignored throughout the crate.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
