//! Worker tool loop as an explicit state machine.
//!
//! ```text
//! AwaitingModel(i) --tool call--> AwaitingTool(i) --observation--> AwaitingModel(i+1)
//!        |                                                                |
//!        +--free text--> AwaitingModel(i+1)                               |
//!        +--`## Handoff`--> Finished(Completed)                           |
//!        +--provider failure--> Finished(ProviderFailed)                  |
//!  (any step that would start iteration max+1) --> Finished(IterationCapReached)
//! ```
//!
//! The machine does no I/O: the worker asks it for the next action, performs
//! it, and feeds the result back.

use crate::core::handoff::{HandoffDraft, parse_handoff};
use crate::core::transcript::{Transcript, TranscriptEntry};
use crate::core::types::{ModelResponse, ToolInvocation, ToolObservation};

/// Hard ceiling on model calls per task.
pub const MAX_ITERATIONS: u32 = 20;

#[derive(Debug, Clone, PartialEq)]
pub enum LoopExit {
    Completed(HandoffDraft),
    IterationCapReached,
    /// The model gateway exhausted its fallback chain.
    ProviderFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopState {
    AwaitingModel {
        iteration: u32,
    },
    AwaitingTool {
        iteration: u32,
        invocation: ToolInvocation,
    },
    Finished(LoopExit),
}

/// What the driver must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopAction {
    CallModel { iteration: u32 },
    RunTool(ToolInvocation),
    Done,
}

#[derive(Debug, Clone)]
pub struct ToolLoop {
    max_iterations: u32,
    state: LoopState,
    transcript: Transcript,
}

impl ToolLoop {
    /// `max_iterations` is clamped to `1..=MAX_ITERATIONS`.
    pub fn new(max_iterations: u32) -> Self {
        Self {
            max_iterations: max_iterations.clamp(1, MAX_ITERATIONS),
            state: LoopState::AwaitingModel { iteration: 1 },
            transcript: Transcript::new(),
        }
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn next_action(&self) -> LoopAction {
        match &self.state {
            LoopState::AwaitingModel { iteration } => LoopAction::CallModel {
                iteration: *iteration,
            },
            LoopState::AwaitingTool { invocation, .. } => LoopAction::RunTool(invocation.clone()),
            LoopState::Finished(_) => LoopAction::Done,
        }
    }

    pub fn on_model_response(&mut self, response: ModelResponse) {
        let LoopState::AwaitingModel { iteration } = self.state else {
            return;
        };
        match response {
            ModelResponse::Text { text } => {
                if let Some(draft) = parse_handoff(&text) {
                    self.state = LoopState::Finished(LoopExit::Completed(draft));
                    return;
                }
                self.transcript
                    .push(TranscriptEntry::ModelText { iteration, text });
                self.advance(iteration);
            }
            ModelResponse::ToolCall(invocation) => {
                self.transcript.push(TranscriptEntry::ToolCall {
                    iteration,
                    invocation: invocation.clone(),
                });
                self.state = LoopState::AwaitingTool {
                    iteration,
                    invocation,
                };
            }
        }
    }

    pub fn on_observation(&mut self, observation: ToolObservation) {
        let LoopState::AwaitingTool { iteration, .. } = self.state else {
            return;
        };
        self.transcript.push(TranscriptEntry::Observation {
            iteration,
            observation,
        });
        self.advance(iteration);
    }

    pub fn on_provider_failure(&mut self, message: impl Into<String>) {
        if !matches!(self.state, LoopState::Finished(_)) {
            self.state = LoopState::Finished(LoopExit::ProviderFailed(message.into()));
        }
    }

    /// Exit reason and transcript. An unfinished loop reports the cap.
    pub fn finish(self) -> (LoopExit, Transcript) {
        let exit = match self.state {
            LoopState::Finished(exit) => exit,
            LoopState::AwaitingModel { .. } | LoopState::AwaitingTool { .. } => {
                LoopExit::IterationCapReached
            }
        };
        (exit, self.transcript)
    }

    fn advance(&mut self, iteration: u32) {
        self.state = if iteration >= self.max_iterations {
            LoopState::Finished(LoopExit::IterationCapReached)
        } else {
            LoopState::AwaitingModel {
                iteration: iteration + 1,
            }
        };
    }
}
