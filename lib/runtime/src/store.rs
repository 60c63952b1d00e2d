//! Conversation state persistence contract.
//!
//! The store is an upsert-keyed map from (bot, user) to state. The runtime
//! serializes all access for one key before it reaches the store, so
//! implementations need not resolve concurrent writes to the same key.

use async_trait::async_trait;
use botwright_core::{BotId, ChatUserId};
use botwright_flow::ConversationState;

/// Trait for conversation state persistence.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the state for a user, or the idle default if none exists.
    async fn load_state(
        &self,
        bot_id: &BotId,
        user_id: &ChatUserId,
    ) -> Result<ConversationState, StoreError>;

    /// Inserts or replaces the state for its (bot, user) key.
    async fn save_state(&self, state: &ConversationState) -> Result<(), StoreError>;

    /// Deletes every state belonging to a bot and returns how many were
    /// removed.
    async fn clear_bot(&self, bot_id: &BotId) -> Result<u64, StoreError>;
}

/// Errors from state store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The stored entry changed underneath the write.
    Conflict { key: String },
    /// The store could not be reached or refused the operation.
    Unavailable { message: String },
    /// A stored entry could not be decoded.
    Corrupt { key: String, message: String },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conflict { key } => write!(f, "write conflict on {key}"),
            Self::Unavailable { message } => write!(f, "state store unavailable: {message}"),
            Self::Corrupt { key, message } => {
                write!(f, "stored state {key} is unreadable: {message}")
            }
        }
    }
}

impl std::error::Error for StoreError {}
