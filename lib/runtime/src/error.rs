//! Error types for the bot runtime.

use crate::instance::InstanceStatus;
use crate::settings::RuntimeSettings;
use crate::source::SourceError;
use crate::store::StoreError;
use crate::transport::TransportError;
use botwright_core::{BotId, ChatUserId};
use botwright_flow::{EvaluationError, FlowId, ValidationError};

/// Errors from supervisor, registry and instance operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The definition failed validation; nothing was deployed.
    Validation {
        bot_id: BotId,
        error: ValidationError,
    },
    /// No instance is registered for the bot.
    NotDeployed { bot_id: BotId },
    /// Another lifecycle operation for the bot is in progress.
    AlreadyDeploying { bot_id: BotId },
    /// The instance exists but is not accepting events.
    BotUnavailable {
        bot_id: BotId,
        status: InstanceStatus,
    },
    /// A flow chained more steps than allowed; the user's position was
    /// reset.
    FlowLoopDetected {
        bot_id: BotId,
        user_id: ChatUserId,
        flow_id: FlowId,
        limit: usize,
    },
    /// Evaluation failed for another reason.
    Evaluation {
        bot_id: BotId,
        error: EvaluationError,
    },
    /// The transport failed.
    Transport {
        bot_id: BotId,
        error: TransportError,
    },
    /// A state load or save did not finish in time; the event was not
    /// applied.
    PersistenceTimeout { bot_id: BotId, user_id: ChatUserId },
    /// The state store failed; the event was not applied.
    Store { bot_id: BotId, error: StoreError },
    /// The definition source failed.
    Source(SourceError),
    /// An instance was asked to move between incompatible statuses.
    InvalidStateTransition {
        bot_id: BotId,
        from: InstanceStatus,
        to: InstanceStatus,
    },
}

impl RuntimeError {
    /// Returns the message the affected user should see, if any.
    #[must_use]
    pub fn user_message(&self, settings: &RuntimeSettings) -> Option<String> {
        match self {
            Self::PersistenceTimeout { .. } | Self::Store { .. } | Self::Evaluation { .. } => {
                Some(settings.retry_message.clone())
            }
            Self::FlowLoopDetected { .. } => Some(settings.loop_message.clone()),
            _ => None,
        }
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation { bot_id, error } => {
                write!(f, "invalid definition for bot {bot_id}: {error}")
            }
            Self::NotDeployed { bot_id } => write!(f, "bot {bot_id} is not deployed"),
            Self::AlreadyDeploying { bot_id } => {
                write!(f, "a deploy for bot {bot_id} is already in progress")
            }
            Self::BotUnavailable { bot_id, status } => {
                write!(f, "bot {bot_id} is unavailable ({status})")
            }
            Self::FlowLoopDetected {
                bot_id,
                user_id,
                flow_id,
                limit,
            } => write!(
                f,
                "flow '{flow_id}' of bot {bot_id} exceeded {limit} steps for user {user_id}"
            ),
            Self::Evaluation { bot_id, error } => {
                write!(f, "evaluation failed for bot {bot_id}: {error}")
            }
            Self::Transport { bot_id, error } => {
                write!(f, "transport error for bot {bot_id}: {error}")
            }
            Self::PersistenceTimeout { bot_id, user_id } => {
                write!(f, "state persistence timed out for bot {bot_id}, user {user_id}")
            }
            Self::Store { bot_id, error } => write!(f, "state store error for bot {bot_id}: {error}"),
            Self::Source(e) => write!(f, "definition source error: {e}"),
            Self::InvalidStateTransition { bot_id, from, to } => {
                write!(f, "bot {bot_id} cannot go from {from} to {to}")
            }
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<SourceError> for RuntimeError {
    fn from(e: SourceError) -> Self {
        Self::Source(e)
    }
}
