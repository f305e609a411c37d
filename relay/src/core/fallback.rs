//! Retry/fallback chain for one logical model call.
//!
//! Two levels are kept apart on purpose:
//!
//! - **retry**: the same model again after a backoff delay, for rate-limited
//!   and transient outcomes, at most `max_retries` attempts per model;
//! - **advance**: the next model of the ordered chain, with a fresh attempt
//!   counter, once retries on the current model are spent (or immediately on a
//!   fatal outcome).
//!
//! A retry never changes the model, and an advance never carries the previous
//! model's attempt count over.

use std::time::Duration;

use crate::core::backoff::Backoff;
use crate::core::types::AttemptOutcome;

/// Where the chain currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainState {
    Attempting { model_index: usize, attempt: u32 },
    Succeeded { model_index: usize },
    Exhausted,
}

/// What the caller must do after recording an outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Succeeded,
    /// Sleep `delay`, then call the same model again.
    Retry {
        model: String,
        attempt: u32,
        delay: Duration,
    },
    /// Call `to` next, starting at attempt 0.
    Advance { from: String, to: String },
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct FallbackChain {
    models: Vec<String>,
    max_retries: u32,
    backoff: Backoff,
    state: ChainState,
}

impl FallbackChain {
    /// `max_retries` is the number of attempts per model (at least one).
    pub fn new(primary: &str, fallbacks: &[String], max_retries: u32, backoff: Backoff) -> Self {
        let mut models = Vec::with_capacity(fallbacks.len() + 1);
        models.push(primary.to_string());
        models.extend(fallbacks.iter().cloned());
        Self {
            models,
            max_retries: max_retries.max(1),
            backoff,
            state: ChainState::Attempting {
                model_index: 0,
                attempt: 0,
            },
        }
    }

    pub fn state(&self) -> &ChainState {
        &self.state
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    /// Model and attempt number of the next call, if one is due.
    pub fn current(&self) -> Option<(&str, u32)> {
        match self.state {
            ChainState::Attempting {
                model_index,
                attempt,
            } => Some((self.models[model_index].as_str(), attempt)),
            ChainState::Succeeded { .. } | ChainState::Exhausted => None,
        }
    }

    /// Record the outcome of the current attempt and move the chain.
    pub fn record(&mut self, outcome: AttemptOutcome) -> Transition {
        let ChainState::Attempting {
            model_index,
            attempt,
        } = self.state
        else {
            return match self.state {
                ChainState::Exhausted => Transition::Exhausted,
                _ => Transition::Succeeded,
            };
        };

        match outcome {
            AttemptOutcome::Success => {
                self.state = ChainState::Succeeded { model_index };
                Transition::Succeeded
            }
            AttemptOutcome::RateLimited | AttemptOutcome::Transient => {
                self.retry_or_advance(model_index, attempt)
            }
            AttemptOutcome::Fatal => self.advance(model_index),
        }
    }

    fn retry_or_advance(&mut self, model_index: usize, attempt: u32) -> Transition {
        let next_attempt = attempt + 1;
        if next_attempt < self.max_retries {
            self.state = ChainState::Attempting {
                model_index,
                attempt: next_attempt,
            };
            return Transition::Retry {
                model: self.models[model_index].clone(),
                attempt: next_attempt,
                delay: self.backoff.delay(attempt),
            };
        }
        self.advance(model_index)
    }

    fn advance(&mut self, model_index: usize) -> Transition {
        let next_index = model_index + 1;
        if next_index >= self.models.len() {
            self.state = ChainState::Exhausted;
            return Transition::Exhausted;
        }
        self.state = ChainState::Attempting {
            model_index: next_index,
            attempt: 0,
        };
        Transition::Advance {
            from: self.models[model_index].clone(),
            to: self.models[next_index].clone(),
        }
    }
}
