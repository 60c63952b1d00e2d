//! Inbound events and outbound actions.
//!
//! These are the messages exchanged with the transport. The engine only
//! reads events and only produces actions.

use botwright_core::ChatUserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// What kind of message the user sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A slash command, e.g. `/start`.
    Command,
    /// Any other text.
    Text,
}

/// A message received from a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// The sender.
    pub user_id: ChatUserId,
    /// Command or text.
    pub kind: EventKind,
    /// For commands, everything after the slash; for text, the text.
    pub payload: String,
    /// When the transport received the message.
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    /// Creates a command event. A leading slash on `name` is ignored.
    #[must_use]
    pub fn command(user_id: ChatUserId, name: impl AsRef<str>) -> Self {
        Self {
            user_id,
            kind: EventKind::Command,
            payload: name.as_ref().trim().trim_start_matches('/').to_string(),
            received_at: Utc::now(),
        }
    }

    /// Creates a text event.
    #[must_use]
    pub fn text(user_id: ChatUserId, text: impl Into<String>) -> Self {
        Self {
            user_id,
            kind: EventKind::Text,
            payload: text.into(),
            received_at: Utc::now(),
        }
    }

    /// Classifies raw user input: `/name ...` is a command, anything else
    /// is text.
    #[must_use]
    pub fn parse(user_id: ChatUserId, input: &str) -> Self {
        let trimmed = input.trim();
        if trimmed.len() > 1 && trimmed.starts_with('/') {
            Self::command(user_id, trimmed)
        } else {
            Self::text(user_id, input)
        }
    }

    /// Returns the command name without the slash, arguments or
    /// `@botname` suffix.
    ///
    /// Gateways may or may not strip the slash from a command payload;
    /// both forms name the same command.
    #[must_use]
    pub fn command_name(&self) -> Option<&str> {
        if self.kind != EventKind::Command {
            return None;
        }
        let word = self.command_text().split_whitespace().next()?;
        word.split('@').next().filter(|name| !name.is_empty())
    }

    fn command_text(&self) -> &str {
        self.payload.trim_start().trim_start_matches('/')
    }

    /// Returns the input as the user typed it.
    #[must_use]
    pub fn input(&self) -> Cow<'_, str> {
        match self.kind {
            EventKind::Command => Cow::Owned(format!("/{}", self.command_text())),
            EventKind::Text => Cow::Borrowed(self.payload.as_str()),
        }
    }

    /// Returns the key compared against flow triggers.
    ///
    /// Commands match as `/name` regardless of arguments; text matches on
    /// its trimmed content.
    #[must_use]
    pub fn trigger_key(&self) -> Cow<'_, str> {
        match self.command_name() {
            Some(name) => Cow::Owned(format!("/{name}")),
            None => Cow::Borrowed(self.payload.trim()),
        }
    }
}

/// Something the runtime should deliver to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundAction {
    /// A plain text reply.
    Reply { text: String },
    /// A question with suggested answers the transport may render as
    /// buttons.
    Prompt { text: String, choices: Vec<String> },
}

impl OutboundAction {
    /// Creates a plain reply.
    #[must_use]
    pub fn reply(text: impl Into<String>) -> Self {
        Self::Reply { text: text.into() }
    }

    /// Creates a prompt with choices.
    #[must_use]
    pub fn prompt(text: impl Into<String>, choices: Vec<String>) -> Self {
        Self::Prompt {
            text: text.into(),
            choices,
        }
    }

    /// Returns the message text.
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Reply { text } | Self::Prompt { text, .. } => text,
        }
    }
}
