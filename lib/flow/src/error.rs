//! Error types for the flow crate.
//!
//! - `ValidationError`: a definition that must never reach a running bot
//! - `EvaluationError`: one inbound event could not be evaluated
//!
//! Neither carries the bot id; the runtime adds that as context.

use crate::graph::{FlowId, StepId};
use std::fmt;

/// A bot definition failed deploy-time validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The bot has no name.
    MissingBotName,
    /// The bot has no transport credential.
    MissingCredential,
    /// A command at the given position has no name.
    MissingCommandName { index: usize },
    /// A command has no static response.
    MissingCommandResponse { command: String },
    /// Two commands share a name.
    DuplicateCommand { command: String },
    /// Two flows share an id.
    DuplicateFlow { flow_id: FlowId },
    /// A flow has an empty trigger.
    MissingTrigger { flow_id: FlowId },
    /// Two flows are started by the same trigger.
    DuplicateTrigger { trigger: String },
    /// A flow has no steps.
    EmptyFlow { flow_id: FlowId },
    /// Two steps in one flow share an id.
    DuplicateStep { flow_id: FlowId, step_id: StepId },
    /// A step uses the terminal id as its own id.
    ReservedStepId { flow_id: FlowId, step_id: StepId },
    /// The explicit entry step does not exist.
    UnknownEntryStep { flow_id: FlowId, step_id: StepId },
    /// A successor reference names no step in the flow.
    DanglingReference {
        flow_id: FlowId,
        step_id: StepId,
        target: StepId,
    },
    /// A prompt offers no options, so the user could never leave it.
    PromptWithoutOptions { flow_id: FlowId, step_id: StepId },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingBotName => write!(f, "bot name is required"),
            Self::MissingCredential => write!(f, "transport credential is required"),
            Self::MissingCommandName { index } => {
                write!(f, "command #{index} has no name")
            }
            Self::MissingCommandResponse { command } => {
                write!(f, "command '/{command}' has no response")
            }
            Self::DuplicateCommand { command } => {
                write!(f, "command '/{command}' is defined more than once")
            }
            Self::DuplicateFlow { flow_id } => {
                write!(f, "flow '{flow_id}' is defined more than once")
            }
            Self::MissingTrigger { flow_id } => {
                write!(f, "flow '{flow_id}' has no trigger")
            }
            Self::DuplicateTrigger { trigger } => {
                write!(f, "trigger '{trigger}' starts more than one flow")
            }
            Self::EmptyFlow { flow_id } => write!(f, "flow '{flow_id}' has no steps"),
            Self::DuplicateStep { flow_id, step_id } => {
                write!(f, "step '{step_id}' is defined more than once in flow '{flow_id}'")
            }
            Self::ReservedStepId { flow_id, step_id } => {
                write!(f, "step id '{step_id}' in flow '{flow_id}' is reserved")
            }
            Self::UnknownEntryStep { flow_id, step_id } => {
                write!(f, "entry step '{step_id}' not found in flow '{flow_id}'")
            }
            Self::DanglingReference {
                flow_id,
                step_id,
                target,
            } => {
                write!(
                    f,
                    "step '{step_id}' in flow '{flow_id}' points to unknown step '{target}'"
                )
            }
            Self::PromptWithoutOptions { flow_id, step_id } => {
                write!(f, "prompt '{step_id}' in flow '{flow_id}' has no options")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Evaluation of a single inbound event failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    /// More steps were chained than the per-event limit allows.
    FlowLoopDetected {
        flow_id: FlowId,
        step_id: StepId,
        limit: usize,
    },
    /// A step reference could not be resolved.
    ///
    /// Validated flows never produce this.
    UnknownStep { flow_id: FlowId, step_id: StepId },
    /// The flow has no entry step.
    NoEntryStep { flow_id: FlowId },
}

impl fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlowLoopDetected {
                flow_id,
                step_id,
                limit,
            } => {
                write!(
                    f,
                    "flow '{flow_id}' exceeded {limit} steps in one event (last step '{step_id}')"
                )
            }
            Self::UnknownStep { flow_id, step_id } => {
                write!(f, "step '{step_id}' not found in flow '{flow_id}'")
            }
            Self::NoEntryStep { flow_id } => write!(f, "flow '{flow_id}' has no entry step"),
        }
    }
}

impl std::error::Error for EvaluationError {}
