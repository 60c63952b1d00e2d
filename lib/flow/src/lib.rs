//! Conversation flows for botwright bots.
//!
//! This crate holds everything about a bot that can be reasoned about
//! without I/O:
//!
//! - **Definitions**: bots, their command tables and their flows
//! - **Flow Graph**: steps linked by id, validated once at deploy time
//! - **Conversation State**: one user's position and variables in a bot
//! - **Engine**: the pure evaluator that turns (flow, state, event) into
//!   the next state plus the messages to send

pub mod definition;
pub mod engine;
pub mod error;
pub mod event;
pub mod graph;
pub mod state;

pub use definition::{BotDefinition, Command, DesiredStatus, TransportCredential};
pub use engine::{DEFAULT_MAX_STEPS_PER_EVENT, Engine, EngineLimits, Evaluation, Outcome};
pub use error::{EvaluationError, ValidationError};
pub use event::{EventKind, InboundEvent, OutboundAction};
pub use graph::{FlowGraph, FlowId, FlowOption, Step, StepId, StepKind, TERMINAL_STEP_ID};
pub use state::ConversationState;
