//! Model gateway: one logical model call with retry and fallback.
//!
//! The gateway is stateless per call. Each [`ModelGateway::complete`] builds a
//! fresh [`FallbackChain`], drives it against the backend and appends every
//! attempt to the session log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::backoff::Backoff;
use crate::core::fallback::{FallbackChain, Transition};
use crate::core::types::{Actor, AttemptOutcome, ModelAttempt, ModelResponse};
use crate::io::config::ModelConfig;
use crate::io::model::{ModelBackend, ModelRequest};
use crate::io::session_log::{SessionLogger, event};

/// Model chain and retry settings for every call through a gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayPolicy {
    pub primary: String,
    pub fallbacks: Vec<String>,
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl GatewayPolicy {
    pub fn from_config(model: &ModelConfig) -> Self {
        Self {
            primary: model.primary.clone(),
            fallbacks: model.fallbacks.clone(),
            max_retries: model.max_retries,
            backoff: model.backoff(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Every model of the chain failed; carries the full attempt trace.
    #[error("all models exhausted after {} attempts: {last_error}", attempts.len())]
    Exhausted {
        attempts: Vec<ModelAttempt>,
        last_error: String,
    },
}

/// Successful logical call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCompletion {
    pub response: ModelResponse,
    /// Model that produced the response.
    pub model: String,
    pub attempts: Vec<ModelAttempt>,
}

pub struct ModelGateway<B> {
    backend: B,
    policy: GatewayPolicy,
    log: SessionLogger,
    sleep: fn(Duration),
    calls: AtomicU64,
}

impl<B: ModelBackend> ModelGateway<B> {
    pub fn new(backend: B, policy: GatewayPolicy, log: SessionLogger) -> Self {
        Self {
            backend,
            policy,
            log,
            sleep: thread::sleep,
            calls: AtomicU64::new(0),
        }
    }

    /// Replace the backoff sleep (tests use a no-op).
    pub fn with_sleeper(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    /// Issue one logical request, retrying and falling back as needed.
    #[instrument(skip_all, fields(actor_id = %request.actor_id))]
    pub fn complete(&self, request: &ModelRequest) -> Result<ModelCompletion, GatewayError> {
        let call_id = format!("call-{}", self.calls.fetch_add(1, Ordering::Relaxed) + 1);
        self.log.record(
            request.actor,
            &request.actor_id,
            event::MODEL_REQUEST,
            &json!({
                "call_id": call_id,
                "prompt": request.prompt,
                "tools": request.tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            }),
        );

        let mut chain = FallbackChain::new(
            &self.policy.primary,
            &self.policy.fallbacks,
            self.policy.max_retries,
            self.policy.backoff,
        );
        let mut attempts = Vec::new();
        let mut last_error = String::new();

        while let Some((model, attempt)) = chain.current() {
            let model = model.to_string();
            let result = self.backend.send(request, &model);
            let outcome = match &result {
                Ok(_) => AttemptOutcome::Success,
                Err(err) => err.outcome(),
            };
            let transition = chain.record(outcome);
            let delay = match &transition {
                Transition::Retry { delay, .. } => Some(*delay),
                _ => None,
            };

            let entry = ModelAttempt {
                call_id: call_id.clone(),
                model: model.clone(),
                attempt,
                outcome,
                delay_ms: delay.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                detail: result.as_ref().err().map(ToString::to_string),
            };
            self.log
                .record(Actor::Gateway, &request.actor_id, event::MODEL_ATTEMPT, &entry);
            attempts.push(entry);

            match result {
                Ok(response) => {
                    self.log.record(
                        request.actor,
                        &request.actor_id,
                        event::MODEL_RESPONSE,
                        &json!({"call_id": call_id, "model": model, "response": response}),
                    );
                    debug!(%model, attempts = attempts.len(), "model call succeeded");
                    return Ok(ModelCompletion {
                        response,
                        model,
                        attempts,
                    });
                }
                Err(err) => last_error = err.to_string(),
            }

            match transition {
                Transition::Retry {
                    model,
                    attempt,
                    delay,
                } => {
                    debug!(%model, attempt, ?delay, "retrying model");
                    (self.sleep)(delay);
                }
                Transition::Advance { from, to } => {
                    info!(%from, %to, "falling back to next model");
                }
                Transition::Exhausted | Transition::Succeeded => break,
            }
        }

        warn!(attempts = attempts.len(), %last_error, "model chain exhausted");
        Err(GatewayError::Exhausted {
            attempts,
            last_error,
        })
    }
}
