//! Per-user conversation state.
//!
//! There is exactly one state per (bot, user) pair. A state with no current
//! step is idle: the user is not inside any flow and the next trigger starts
//! one.

use crate::graph::{FlowId, StepId};
use botwright_core::{BotId, ChatUserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Where one user is in one bot's flows, plus the variables collected so
/// far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    /// The bot.
    pub bot_id: BotId,
    /// The user.
    pub user_id: ChatUserId,
    /// The flow the user is in.
    #[serde(default)]
    pub current_flow_id: Option<FlowId>,
    /// The step the user is resting on.
    #[serde(default)]
    pub current_step_id: Option<StepId>,
    /// Values collected by prompts.
    #[serde(default)]
    pub variables: BTreeMap<String, JsonValue>,
    /// Last time an event from this user was applied.
    pub last_interaction_at: DateTime<Utc>,
}

impl ConversationState {
    /// Creates the idle state for a user seen for the first time.
    #[must_use]
    pub fn new(bot_id: BotId, user_id: ChatUserId) -> Self {
        Self {
            bot_id,
            user_id,
            current_flow_id: None,
            current_step_id: None,
            variables: BTreeMap::new(),
            last_interaction_at: Utc::now(),
        }
    }

    /// Returns true if the user is not inside a flow.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.current_step_id.is_none()
    }

    /// Returns the resting step if the user is inside `flow_id`.
    #[must_use]
    pub fn step_in(&self, flow_id: &FlowId) -> Option<&StepId> {
        if self.current_flow_id.as_ref() == Some(flow_id) {
            self.current_step_id.as_ref()
        } else {
            None
        }
    }

    /// Moves the user onto a step.
    pub fn enter(&mut self, flow_id: FlowId, step_id: StepId) {
        self.current_flow_id = Some(flow_id);
        self.current_step_id = Some(step_id);
    }

    /// Returns the user to awaiting a trigger. Variables are kept.
    pub fn clear_position(&mut self) {
        self.current_flow_id = None;
        self.current_step_id = None;
    }

    /// Sets a variable.
    pub fn set_variable(&mut self, name: impl Into<String>, value: JsonValue) {
        self.variables.insert(name.into(), value);
    }

    /// Returns a variable rendered as text, for comparison against branch
    /// arms. Null and structured values have no text form.
    #[must_use]
    pub fn variable_text(&self, name: &str) -> Option<String> {
        match self.variables.get(name)? {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => None,
        }
    }

    /// Records an interaction.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_interaction_at = at;
    }
}
