//! Flow graphs.
//!
//! A flow is a set of steps linked by id. Links may form cycles; the engine
//! bounds how far one event can travel instead of forbidding them. Every
//! link must resolve to a step of the same flow or to [`TERMINAL_STEP_ID`],
//! which [`FlowGraph::validate`] checks before a bot is started.

use crate::error::ValidationError;
use crate::event::InboundEvent;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// The distinguished step id that ends a flow.
pub const TERMINAL_STEP_ID: &str = "END";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Returns the id as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a flow, unique within a bot.
    FlowId
);

string_id!(
    /// Identifier of a step, unique within a flow.
    StepId
);

impl StepId {
    /// Returns the terminal step id.
    #[must_use]
    pub fn terminal() -> Self {
        Self(TERMINAL_STEP_ID.to_string())
    }

    /// Returns true if this is the terminal step id.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.0 == TERMINAL_STEP_ID
    }
}

/// A labelled link to another step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowOption {
    /// The answer that selects this option.
    #[serde(alias = "text")]
    pub label: String,
    /// Where the flow continues.
    #[serde(alias = "next_step_id")]
    pub next: StepId,
}

impl FlowOption {
    /// Creates an option.
    #[must_use]
    pub fn new(label: impl Into<String>, next: impl Into<StepId>) -> Self {
        Self {
            label: label.into(),
            next: next.into(),
        }
    }
}

/// What a step does when the conversation reaches it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Sends the step's message and moves on to `next`.
    Message { next: StepId },
    /// Sends the step's message and waits for the user to pick an option.
    Prompt {
        options: Vec<FlowOption>,
        /// Variable that receives the chosen label.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        store_as: Option<String>,
    },
    /// Chooses a successor from the value of a conversation variable.
    Branch {
        variable: String,
        #[serde(default)]
        arms: Vec<FlowOption>,
        otherwise: StepId,
    },
}

/// A node in a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Step id, unique within the flow.
    pub id: StepId,
    /// Text sent when the step is reached.
    #[serde(default)]
    pub message: String,
    /// Behaviour of the step.
    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    /// Creates a message step.
    #[must_use]
    pub fn message(id: impl Into<StepId>, message: impl Into<String>, next: impl Into<StepId>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            kind: StepKind::Message { next: next.into() },
        }
    }

    /// Creates a prompt step.
    #[must_use]
    pub fn prompt(id: impl Into<StepId>, message: impl Into<String>, options: Vec<FlowOption>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            kind: StepKind::Prompt {
                options,
                store_as: None,
            },
        }
    }

    /// Creates a branch step.
    #[must_use]
    pub fn branch(
        id: impl Into<StepId>,
        variable: impl Into<String>,
        arms: Vec<FlowOption>,
        otherwise: impl Into<StepId>,
    ) -> Self {
        Self {
            id: id.into(),
            message: String::new(),
            kind: StepKind::Branch {
                variable: variable.into(),
                arms,
                otherwise: otherwise.into(),
            },
        }
    }

    /// Stores the chosen label of a prompt in `variable`. No-op for other
    /// kinds.
    #[must_use]
    pub fn storing_as(mut self, variable: impl Into<String>) -> Self {
        if let StepKind::Prompt { store_as, .. } = &mut self.kind {
            *store_as = Some(variable.into());
        }
        self
    }

    /// Returns every step id this step can continue to.
    #[must_use]
    pub fn successors(&self) -> Vec<&StepId> {
        match &self.kind {
            StepKind::Message { next } => vec![next],
            StepKind::Prompt { options, .. } => options.iter().map(|o| &o.next).collect(),
            StepKind::Branch {
                arms, otherwise, ..
            } => arms
                .iter()
                .map(|a| &a.next)
                .chain(std::iter::once(otherwise))
                .collect(),
        }
    }
}

/// Serialized form of a flow graph; the lookup index is rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlowGraphData {
    id: FlowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    trigger: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entry: Option<StepId>,
    steps: Vec<Step>,
}

/// A conversation flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "FlowGraphData", into = "FlowGraphData")]
pub struct FlowGraph {
    id: FlowId,
    name: Option<String>,
    trigger: String,
    entry: Option<StepId>,
    steps: Vec<Step>,
    /// Step id to position in `steps`; the first definition of an id wins.
    index: HashMap<StepId, usize>,
}

impl From<FlowGraphData> for FlowGraph {
    fn from(data: FlowGraphData) -> Self {
        let mut graph = Self {
            id: data.id,
            name: data.name,
            trigger: data.trigger,
            entry: data.entry,
            steps: data.steps,
            index: HashMap::new(),
        };
        graph.rebuild_index();
        graph
    }
}

impl From<FlowGraph> for FlowGraphData {
    fn from(graph: FlowGraph) -> Self {
        Self {
            id: graph.id,
            name: graph.name,
            trigger: graph.trigger,
            entry: graph.entry,
            steps: graph.steps,
        }
    }
}

impl FlowGraph {
    /// Creates a flow whose entry is its first step.
    #[must_use]
    pub fn new(id: impl Into<FlowId>, trigger: impl Into<String>, steps: Vec<Step>) -> Self {
        FlowGraphData {
            id: id.into(),
            name: None,
            trigger: trigger.into(),
            entry: None,
            steps,
        }
        .into()
    }

    /// Sets an explicit entry step.
    #[must_use]
    pub fn with_entry(mut self, entry: impl Into<StepId>) -> Self {
        self.entry = Some(entry.into());
        self
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (position, step) in self.steps.iter().enumerate() {
            self.index.entry(step.id.clone()).or_insert(position);
        }
    }

    /// Returns the flow id.
    #[must_use]
    pub fn id(&self) -> &FlowId {
        &self.id
    }

    /// Returns the display name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the trigger as written in the definition.
    #[must_use]
    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    /// Returns all steps in definition order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Looks up a step by id.
    #[must_use]
    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.index.get(id).and_then(|&position| self.steps.get(position))
    }

    /// Returns the step a new run starts at.
    #[must_use]
    pub fn entry_step_id(&self) -> Option<&StepId> {
        self.entry
            .as_ref()
            .or_else(|| self.steps.first().map(|s| &s.id))
    }

    /// Returns true if `event` starts this flow.
    #[must_use]
    pub fn matches_trigger(&self, event: &InboundEvent) -> bool {
        let trigger = self.trigger.trim();
        !trigger.is_empty() && event.trigger_key() == trigger
    }

    /// Checks the structural invariants of the flow.
    ///
    /// # Errors
    ///
    /// Returns the first violation found:
    /// - missing trigger or steps
    /// - duplicate or reserved step ids
    /// - an unknown entry step
    /// - a successor that names no step and is not the terminal id
    /// - a prompt without options
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.trigger.trim().is_empty() {
            return Err(ValidationError::MissingTrigger {
                flow_id: self.id.clone(),
            });
        }
        if self.steps.is_empty() {
            return Err(ValidationError::EmptyFlow {
                flow_id: self.id.clone(),
            });
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.is_terminal() {
                return Err(ValidationError::ReservedStepId {
                    flow_id: self.id.clone(),
                    step_id: step.id.clone(),
                });
            }
            if !seen.insert(&step.id) {
                return Err(ValidationError::DuplicateStep {
                    flow_id: self.id.clone(),
                    step_id: step.id.clone(),
                });
            }
        }

        if let Some(entry) = &self.entry
            && !self.index.contains_key(entry)
        {
            return Err(ValidationError::UnknownEntryStep {
                flow_id: self.id.clone(),
                step_id: entry.clone(),
            });
        }

        for step in &self.steps {
            if let StepKind::Prompt { options, .. } = &step.kind
                && options.is_empty()
            {
                return Err(ValidationError::PromptWithoutOptions {
                    flow_id: self.id.clone(),
                    step_id: step.id.clone(),
                });
            }
            for target in step.successors() {
                if !target.is_terminal() && !self.index.contains_key(target) {
                    return Err(ValidationError::DanglingReference {
                        flow_id: self.id.clone(),
                        step_id: step.id.clone(),
                        target: target.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Returns the steps no path from the entry step can reach.
    ///
    /// Unreachable steps are legal but usually an authoring mistake.
    #[must_use]
    pub fn unreachable_steps(&self) -> Vec<&StepId> {
        let mut graph: DiGraph<&StepId, ()> = DiGraph::new();
        let nodes: HashMap<&StepId, NodeIndex> = self
            .index
            .keys()
            .map(|id| (id, graph.add_node(id)))
            .collect();

        for step in &self.steps {
            let Some(&from) = nodes.get(&step.id) else {
                continue;
            };
            for target in step.successors() {
                if let Some(&to) = nodes.get(target) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let mut reachable = HashSet::new();
        if let Some(&start) = self.entry_step_id().and_then(|entry| nodes.get(entry)) {
            let mut dfs = Dfs::new(&graph, start);
            while let Some(node) = dfs.next(&graph) {
                reachable.insert(node);
            }
        }

        self.steps
            .iter()
            .filter(|step| {
                nodes
                    .get(&step.id)
                    .is_some_and(|node| !reachable.contains(node))
            })
            .map(|step| &step.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiz() -> FlowGraph {
        FlowGraph::new(
            "quiz",
            "/quiz",
            vec![
                Step::prompt(
                    "q1",
                    "Pick A or B",
                    vec![FlowOption::new("A", "r1"), FlowOption::new("B", "r2")],
                ),
                Step::message("r1", "You picked A", TERMINAL_STEP_ID),
                Step::message("r2", "You picked B", TERMINAL_STEP_ID),
            ],
        )
    }

    #[test]
    fn valid_flow_passes() {
        let flow = quiz();
        assert!(flow.validate().is_ok());
        assert_eq!(flow.entry_step_id(), Some(&StepId::from("q1")));
        assert!(flow.step(&StepId::from("r2")).is_some());
    }

    #[test]
    fn dangling_option_is_rejected() {
        let flow = FlowGraph::new(
            "quiz",
            "/quiz",
            vec![Step::prompt(
                "q1",
                "Pick",
                vec![FlowOption::new("A", "missing")],
            )],
        );
        assert_eq!(
            flow.validate(),
            Err(ValidationError::DanglingReference {
                flow_id: FlowId::from("quiz"),
                step_id: StepId::from("q1"),
                target: StepId::from("missing"),
            })
        );
    }

    #[test]
    fn cycles_are_allowed() {
        let flow = FlowGraph::new(
            "loop",
            "/loop",
            vec![
                Step::message("a", "ping", "b"),
                Step::prompt("b", "again?", vec![FlowOption::new("yes", "a"), FlowOption::new("no", TERMINAL_STEP_ID)]),
            ],
        );
        assert!(flow.validate().is_ok());
    }

    #[test]
    fn duplicate_and_reserved_ids_are_rejected() {
        let duplicate = FlowGraph::new(
            "f",
            "/f",
            vec![
                Step::message("a", "one", TERMINAL_STEP_ID),
                Step::message("a", "two", TERMINAL_STEP_ID),
            ],
        );
        assert!(matches!(
            duplicate.validate(),
            Err(ValidationError::DuplicateStep { .. })
        ));

        let reserved = FlowGraph::new("f", "/f", vec![Step::message(TERMINAL_STEP_ID, "x", "x")]);
        assert!(matches!(
            reserved.validate(),
            Err(ValidationError::ReservedStepId { .. })
        ));
    }

    #[test]
    fn empty_prompt_and_missing_trigger_are_rejected() {
        let prompt = FlowGraph::new("f", "/f", vec![Step::prompt("p", "stuck", vec![])]);
        assert!(matches!(
            prompt.validate(),
            Err(ValidationError::PromptWithoutOptions { .. })
        ));

        let untriggered = FlowGraph::new("f", "  ", vec![Step::message("a", "x", TERMINAL_STEP_ID)]);
        assert!(matches!(
            untriggered.validate(),
            Err(ValidationError::MissingTrigger { .. })
        ));
    }

    #[test]
    fn unknown_entry_is_rejected() {
        let flow = quiz().with_entry("nope");
        assert!(matches!(
            flow.validate(),
            Err(ValidationError::UnknownEntryStep { .. })
        ));
    }

    #[test]
    fn unreachable_steps_are_reported() {
        let mut steps = quiz().steps().to_vec();
        steps.push(Step::message("orphan", "never", TERMINAL_STEP_ID));
        let flow = FlowGraph::new("quiz", "/quiz", steps);

        assert_eq!(flow.unreachable_steps(), vec![&StepId::from("orphan")]);
        assert!(quiz().unreachable_steps().is_empty());
    }

    #[test]
    fn deserializes_authoring_format() {
        let json = r#"{
            "id": "quiz",
            "trigger": "/quiz",
            "steps": [
                {"id": "q1", "kind": "prompt", "message": "Pick A or B",
                 "options": [{"label": "A", "next": "r1"}, {"text": "B", "next": "r2"}]},
                {"id": "r1", "kind": "message", "message": "You picked A", "next": "END"},
                {"id": "r2", "kind": "message", "message": "You picked B", "next": "END"}
            ]
        }"#;
        let flow: FlowGraph = serde_json::from_str(json).expect("deserialize");
        assert_eq!(flow, quiz());
        assert!(flow.step(&StepId::from("r1")).is_some());
    }

    #[test]
    fn trigger_matches_command_with_arguments() {
        let user = "1".parse().expect("user id");
        let flow = quiz();
        assert!(flow.matches_trigger(&InboundEvent::parse(user, "/quiz now")));

        let user = "1".parse().expect("user id");
        assert!(!flow.matches_trigger(&InboundEvent::text(user, "quiz")));
    }
}
