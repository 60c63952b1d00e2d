//! Bot definitions.
//!
//! A definition is authored elsewhere and handed to the runtime whole. The
//! runtime never edits one; a redeploy replaces it.

use crate::error::ValidationError;
use crate::event::InboundEvent;
use crate::graph::{FlowGraph, FlowId};
use botwright_core::BotId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Lifecycle status requested by the bot's author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredStatus {
    /// Being edited; never deployed automatically.
    #[default]
    Draft,
    /// Deployed only on explicit request.
    Inactive,
    /// Redeployed whenever the runtime starts.
    Active,
}

/// Secret used by the transport to connect on the bot's behalf.
///
/// The value never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportCredential(String);

impl TransportCredential {
    /// Wraps a credential.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Returns the secret.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns true if the credential is blank.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for TransportCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransportCredential(<redacted>)")
    }
}

/// A slash command with a fixed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Name without the leading slash.
    pub name: String,
    /// Human-readable description shown in command menus.
    #[serde(default)]
    pub description: String,
    /// The reply sent for every invocation.
    #[serde(alias = "static_response")]
    pub response: String,
}

impl Command {
    /// Creates a command. A leading slash on `name` is dropped.
    #[must_use]
    pub fn new(name: impl AsRef<str>, response: impl Into<String>) -> Self {
        Self {
            name: normalize_command_name(name.as_ref()).to_string(),
            description: String::new(),
            response: response.into(),
        }
    }
}

fn normalize_command_name(name: &str) -> &str {
    name.trim().trim_start_matches('/')
}

/// Everything the runtime needs to run one bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotDefinition {
    /// Bot id.
    #[serde(alias = "_id")]
    pub id: BotId,
    /// Display name.
    pub name: String,
    /// Credential passed to the transport on subscribe.
    #[serde(alias = "token")]
    pub transport_credential: TransportCredential,
    /// Command table.
    #[serde(default)]
    pub commands: Vec<Command>,
    /// Conversation flows.
    #[serde(default)]
    pub flows: Vec<FlowGraph>,
    /// Status requested by the author.
    #[serde(default, alias = "status")]
    pub desired_status: DesiredStatus,
}

impl BotDefinition {
    /// Creates a definition with no commands or flows.
    #[must_use]
    pub fn new(id: BotId, name: impl Into<String>, credential: TransportCredential) -> Self {
        Self {
            id,
            name: name.into(),
            transport_credential: credential,
            commands: Vec::new(),
            flows: Vec::new(),
            desired_status: DesiredStatus::Draft,
        }
    }

    /// Adds a command.
    #[must_use]
    pub fn with_command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Adds a flow.
    #[must_use]
    pub fn with_flow(mut self, flow: FlowGraph) -> Self {
        self.flows.push(flow);
        self
    }

    /// Sets the desired status.
    #[must_use]
    pub fn with_status(mut self, status: DesiredStatus) -> Self {
        self.desired_status = status;
        self
    }

    /// Looks up a command by name, with or without the leading slash.
    #[must_use]
    pub fn command(&self, name: &str) -> Option<&Command> {
        let name = normalize_command_name(name);
        self.commands
            .iter()
            .find(|c| normalize_command_name(&c.name) == name)
    }

    /// Looks up a flow by id.
    #[must_use]
    pub fn flow(&self, id: &FlowId) -> Option<&FlowGraph> {
        self.flows.iter().find(|f| f.id() == id)
    }

    /// Returns the flow `event` would start, if any.
    #[must_use]
    pub fn triggered_flow(&self, event: &InboundEvent) -> Option<&FlowGraph> {
        self.flows.iter().find(|f| f.matches_trigger(event))
    }

    /// Validates the whole definition.
    ///
    /// # Errors
    ///
    /// Returns the first problem with the bot's identity, its command
    /// table, or any of its flows.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingBotName);
        }
        if self.transport_credential.is_empty() {
            return Err(ValidationError::MissingCredential);
        }

        let mut command_names = HashSet::new();
        for (index, command) in self.commands.iter().enumerate() {
            let name = normalize_command_name(&command.name);
            if name.is_empty() {
                return Err(ValidationError::MissingCommandName { index });
            }
            if command.response.trim().is_empty() {
                return Err(ValidationError::MissingCommandResponse {
                    command: name.to_string(),
                });
            }
            if !command_names.insert(name) {
                return Err(ValidationError::DuplicateCommand {
                    command: name.to_string(),
                });
            }
        }

        let mut flow_ids = HashSet::new();
        let mut triggers = HashSet::new();
        for flow in &self.flows {
            if !flow_ids.insert(flow.id()) {
                return Err(ValidationError::DuplicateFlow {
                    flow_id: flow.id().clone(),
                });
            }
            flow.validate()?;
            if !triggers.insert(flow.trigger().trim()) {
                return Err(ValidationError::DuplicateTrigger {
                    trigger: flow.trigger().trim().to_string(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FlowOption, Step, TERMINAL_STEP_ID};

    fn bot() -> BotDefinition {
        BotDefinition::new(
            "quiz-bot".parse().expect("bot id"),
            "Quiz Bot",
            TransportCredential::new("123:abc"),
        )
        .with_command(Command::new("/help", "Send /quiz to play"))
        .with_flow(FlowGraph::new(
            "quiz",
            "/quiz",
            vec![
                Step::prompt("q1", "Pick A or B", vec![FlowOption::new("A", "r1")]),
                Step::message("r1", "You picked A", TERMINAL_STEP_ID),
            ],
        ))
    }

    #[test]
    fn valid_definition_passes() {
        assert!(bot().validate().is_ok());
    }

    #[test]
    fn command_lookup_ignores_slash() {
        let bot = bot();
        assert_eq!(bot.command("help").map(|c| c.response.as_str()), Some("Send /quiz to play"));
        assert!(bot.command("/help").is_some());
        assert!(bot.command("quiz").is_none());
    }

    #[test]
    fn duplicate_commands_are_rejected() {
        let bot = bot().with_command(Command::new("help", "again"));
        assert_eq!(
            bot.validate(),
            Err(ValidationError::DuplicateCommand {
                command: "help".to_string()
            })
        );
    }

    #[test]
    fn command_without_response_is_rejected() {
        let bot = bot().with_command(Command::new("about", "  "));
        assert!(matches!(
            bot.validate(),
            Err(ValidationError::MissingCommandResponse { .. })
        ));
    }

    #[test]
    fn blank_credential_is_rejected() {
        let mut bot = bot();
        bot.transport_credential = TransportCredential::new("");
        assert_eq!(bot.validate(), Err(ValidationError::MissingCredential));
    }

    #[test]
    fn colliding_triggers_are_rejected() {
        let bot = bot().with_flow(FlowGraph::new(
            "quiz2",
            "/quiz",
            vec![Step::message("a", "x", TERMINAL_STEP_ID)],
        ));
        assert!(matches!(
            bot.validate(),
            Err(ValidationError::DuplicateTrigger { .. })
        ));
    }

    #[test]
    fn invalid_flow_fails_definition() {
        let bot = bot().with_flow(FlowGraph::new(
            "broken",
            "/broken",
            vec![Step::message("a", "x", "nowhere")],
        ));
        assert!(matches!(
            bot.validate(),
            Err(ValidationError::DanglingReference { .. })
        ));
    }

    #[test]
    fn credential_is_redacted_in_debug() {
        let debug = format!("{:?}", bot());
        assert!(!debug.contains("123:abc"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn deserializes_store_document() {
        let json = r#"{
            "_id": "65a1f0c2e4b0a1b2c3d4e5f6",
            "name": "Support",
            "token": "999:xyz",
            "commands": [{"name": "start", "description": "Begin", "response": "Hi!"}],
            "flows": [],
            "status": "active"
        }"#;
        let bot: BotDefinition = serde_json::from_str(json).expect("deserialize");
        assert_eq!(bot.desired_status, DesiredStatus::Active);
        assert_eq!(bot.transport_credential.expose(), "999:xyz");
        assert_eq!(bot.command("start").map(|c| c.description.as_str()), Some("Begin"));
    }
}
