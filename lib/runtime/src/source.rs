//! Bot definition source contract.
//!
//! Definitions are owned by the authoring subsystem. The runtime only reads
//! them: one at a time on deploy-by-id, all active ones on startup.

use async_trait::async_trait;
use botwright_core::BotId;
use botwright_flow::BotDefinition;

/// Trait for fetching bot definitions.
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    /// Fetches one definition.
    async fn get_bot_definition(&self, bot_id: &BotId) -> Result<BotDefinition, SourceError>;

    /// Fetches every definition whose desired status is active.
    async fn list_active_definitions(&self) -> Result<Vec<BotDefinition>, SourceError>;
}

/// Errors from definition source operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// No definition exists for the bot.
    NotFound { bot_id: BotId },
    /// The source could not be queried.
    RequestFailed { message: String },
    /// The source returned something that is not a definition.
    Malformed { message: String },
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { bot_id } => write!(f, "bot definition not found: {bot_id}"),
            Self::RequestFailed { message } => {
                write!(f, "definition source request failed: {message}")
            }
            Self::Malformed { message } => write!(f, "malformed bot definition: {message}"),
        }
    }
}

impl std::error::Error for SourceError {}
