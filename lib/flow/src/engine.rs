//! Flow evaluation.
//!
//! The engine is a pure function of (flow, state, event). It performs no
//! I/O and never mutates its inputs; the caller persists the returned state
//! and delivers the returned actions.
//!
//! Evaluation rules:
//! 1. An event matching the flow's trigger (re)starts the flow at its entry.
//! 2. Otherwise, if the user rests on a prompt of this flow, the input is
//!    compared with the prompt's option labels. The first exact match
//!    continues the flow; no match re-sends the prompt and leaves the state
//!    as it was.
//! 3. Otherwise the event is ignored.
//!
//! Message and branch steps continue automatically. Each step visited in
//! one event counts against [`EngineLimits::max_steps_per_event`]; going
//! over it fails with [`EvaluationError::FlowLoopDetected`]. Reaching the
//! terminal id clears the user's position.

use crate::error::EvaluationError;
use crate::event::{InboundEvent, OutboundAction};
use crate::graph::{FlowGraph, Step, StepId, StepKind};
use crate::state::ConversationState;
use serde_json::Value as JsonValue;

/// Default bound on steps visited while handling one event.
pub const DEFAULT_MAX_STEPS_PER_EVENT: usize = 64;

/// Bounds applied to a single evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineLimits {
    /// Maximum number of steps visited for one inbound event.
    pub max_steps_per_event: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_steps_per_event: DEFAULT_MAX_STEPS_PER_EVENT,
        }
    }
}

/// How an evaluation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The event does not concern this flow.
    Ignored,
    /// The flow stopped on a prompt and waits for the user.
    AwaitingInput,
    /// The input matched no option; the prompt was sent again.
    Reprompted,
    /// The flow reached its terminal step.
    Completed,
    /// The stored position no longer exists in the flow and was cleared.
    Reset,
}

/// Result of evaluating one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// The state to persist.
    pub state: ConversationState,
    /// Messages to deliver, in order.
    pub actions: Vec<OutboundAction>,
    /// How evaluation ended.
    pub outcome: Outcome,
}

impl Evaluation {
    fn without_actions(state: ConversationState, outcome: Outcome) -> Self {
        Self {
            state,
            actions: Vec::new(),
            outcome,
        }
    }
}

/// The flow evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Engine {
    limits: EngineLimits,
}

impl Engine {
    /// Creates an engine with the given limits.
    #[must_use]
    pub fn new(limits: EngineLimits) -> Self {
        Self { limits }
    }

    /// Evaluates `event` against `flow` from `state`.
    ///
    /// # Errors
    ///
    /// Returns [`EvaluationError::FlowLoopDetected`] when the step chain
    /// exceeds the limit. Validated flows produce no other error.
    pub fn evaluate(
        &self,
        flow: &FlowGraph,
        state: &ConversationState,
        event: &InboundEvent,
    ) -> Result<Evaluation, EvaluationError> {
        let mut next = state.clone();

        let mut resting = next.step_in(flow.id()).cloned();
        if resting.as_ref().is_some_and(StepId::is_terminal) {
            next.clear_position();
            resting = None;
        }

        if flow.matches_trigger(event) {
            let entry = flow
                .entry_step_id()
                .ok_or_else(|| EvaluationError::NoEntryStep {
                    flow_id: flow.id().clone(),
                })?
                .clone();
            next.clear_position();
            return self.walk(flow, next, entry);
        }

        let Some(step_id) = resting else {
            return Ok(Evaluation::without_actions(next, Outcome::Ignored));
        };

        let Some(step) = flow.step(&step_id) else {
            next.clear_position();
            return Ok(Evaluation::without_actions(next, Outcome::Reset));
        };

        match &step.kind {
            StepKind::Prompt { options, store_as } => {
                let input = event.input();
                let input = input.trim();
                match options.iter().find(|option| option.label == input) {
                    Some(option) => {
                        if let Some(variable) = store_as {
                            next.set_variable(variable.clone(), JsonValue::String(option.label.clone()));
                        }
                        self.walk(flow, next, option.next.clone())
                    }
                    None => Ok(Evaluation {
                        state: next,
                        actions: vec![prompt_action(step)],
                        outcome: Outcome::Reprompted,
                    }),
                }
            }
            StepKind::Message { .. } | StepKind::Branch { .. } => self.walk(flow, next, step_id),
        }
    }

    /// Follows steps from `start` until a prompt, the terminal id, or the
    /// step limit.
    fn walk(
        &self,
        flow: &FlowGraph,
        mut state: ConversationState,
        start: StepId,
    ) -> Result<Evaluation, EvaluationError> {
        let mut actions = Vec::new();
        let mut current = start;
        let mut visited = 0usize;

        loop {
            if current.is_terminal() {
                state.clear_position();
                return Ok(Evaluation {
                    state,
                    actions,
                    outcome: Outcome::Completed,
                });
            }

            visited += 1;
            if visited > self.limits.max_steps_per_event {
                return Err(EvaluationError::FlowLoopDetected {
                    flow_id: flow.id().clone(),
                    step_id: current,
                    limit: self.limits.max_steps_per_event,
                });
            }

            let step = flow
                .step(&current)
                .ok_or_else(|| EvaluationError::UnknownStep {
                    flow_id: flow.id().clone(),
                    step_id: current.clone(),
                })?;

            match &step.kind {
                StepKind::Message { next } => {
                    if !step.message.is_empty() {
                        actions.push(OutboundAction::reply(step.message.clone()));
                    }
                    current = next.clone();
                }
                StepKind::Prompt { .. } => {
                    actions.push(prompt_action(step));
                    state.enter(flow.id().clone(), current);
                    return Ok(Evaluation {
                        state,
                        actions,
                        outcome: Outcome::AwaitingInput,
                    });
                }
                StepKind::Branch {
                    variable,
                    arms,
                    otherwise,
                } => {
                    if !step.message.is_empty() {
                        actions.push(OutboundAction::reply(step.message.clone()));
                    }
                    let value = state.variable_text(variable);
                    current = arms
                        .iter()
                        .find(|arm| value.as_deref() == Some(arm.label.as_str()))
                        .map_or(otherwise, |arm| &arm.next)
                        .clone();
                }
            }
        }
    }
}

fn prompt_action(step: &Step) -> OutboundAction {
    let choices = match &step.kind {
        StepKind::Prompt { options, .. } => options.iter().map(|o| o.label.clone()).collect(),
        StepKind::Message { .. } | StepKind::Branch { .. } => Vec::new(),
    };
    OutboundAction::prompt(step.message.clone(), choices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FlowId, FlowOption, TERMINAL_STEP_ID};
    use botwright_core::ChatUserId;

    fn user() -> ChatUserId {
        "u1".parse().expect("user id")
    }

    fn idle() -> ConversationState {
        ConversationState::new("bot".parse().expect("bot id"), user())
    }

    fn quiz() -> FlowGraph {
        FlowGraph::new(
            "quiz",
            "/quiz",
            vec![
                Step::prompt(
                    "q1",
                    "Pick A or B",
                    vec![FlowOption::new("A", "r1"), FlowOption::new("B", "r2")],
                )
                .storing_as("choice"),
                Step::message("r1", "You picked A", TERMINAL_STEP_ID),
                Step::message("r2", "You picked B", TERMINAL_STEP_ID),
            ],
        )
    }

    fn texts(evaluation: &Evaluation) -> Vec<&str> {
        evaluation.actions.iter().map(OutboundAction::text).collect()
    }

    #[test]
    fn quiz_scenario() {
        let engine = Engine::default();
        let flow = quiz();

        let first = engine
            .evaluate(&flow, &idle(), &InboundEvent::parse(user(), "/quiz"))
            .expect("trigger");
        assert_eq!(texts(&first), vec!["Pick A or B"]);
        assert_eq!(first.outcome, Outcome::AwaitingInput);
        assert_eq!(first.state.current_step_id, Some(StepId::from("q1")));
        assert_eq!(first.state.current_flow_id, Some(FlowId::from("quiz")));

        let second = engine
            .evaluate(&flow, &first.state, &InboundEvent::text(user(), "A"))
            .expect("answer");
        assert_eq!(texts(&second), vec!["You picked A"]);
        assert_eq!(second.outcome, Outcome::Completed);
        assert!(second.state.is_idle());
        assert_eq!(second.state.current_flow_id, None);
        assert_eq!(second.state.variable_text("choice").as_deref(), Some("A"));
    }

    #[test]
    fn prompt_carries_choices() {
        let evaluation = Engine::default()
            .evaluate(&quiz(), &idle(), &InboundEvent::parse(user(), "/quiz"))
            .expect("trigger");
        assert_eq!(
            evaluation.actions,
            vec![OutboundAction::prompt("Pick A or B", vec!["A".into(), "B".into()])]
        );
    }

    #[test]
    fn invalid_answer_reprompts_without_changing_state() {
        let engine = Engine::default();
        let flow = quiz();
        let waiting = engine
            .evaluate(&flow, &idle(), &InboundEvent::parse(user(), "/quiz"))
            .expect("trigger")
            .state;

        for input in ["C", "a", "", "A or B"] {
            let evaluation = engine
                .evaluate(&flow, &waiting, &InboundEvent::text(user(), input))
                .expect("reprompt");
            assert_eq!(evaluation.outcome, Outcome::Reprompted);
            assert_eq!(evaluation.state, waiting);
            assert_eq!(texts(&evaluation), vec!["Pick A or B"]);
        }
    }

    #[test]
    fn answer_is_trimmed_before_matching() {
        let engine = Engine::default();
        let flow = quiz();
        let waiting = engine
            .evaluate(&flow, &idle(), &InboundEvent::parse(user(), "/quiz"))
            .expect("trigger")
            .state;

        let evaluation = engine
            .evaluate(&flow, &waiting, &InboundEvent::text(user(), " B\n"))
            .expect("answer");
        assert_eq!(texts(&evaluation), vec!["You picked B"]);
    }

    #[test]
    fn idle_user_without_trigger_is_ignored() {
        let state = idle();
        let evaluation = Engine::default()
            .evaluate(&quiz(), &state, &InboundEvent::text(user(), "hello"))
            .expect("ignored");
        assert_eq!(evaluation.outcome, Outcome::Ignored);
        assert!(evaluation.actions.is_empty());
        assert_eq!(evaluation.state, state);
    }

    #[test]
    fn terminal_position_always_evaluates_to_idle() {
        let engine = Engine::default();
        let flow = quiz();
        let mut state = idle();
        state.enter(FlowId::from("quiz"), StepId::terminal());

        for input in ["A", "anything", "/other"] {
            let evaluation = engine
                .evaluate(&flow, &state, &InboundEvent::parse(user(), input))
                .expect("evaluate");
            assert_eq!(evaluation.state.current_flow_id, None);
            assert_eq!(evaluation.state.current_step_id, None);
        }
    }

    #[test]
    fn trigger_restarts_a_running_flow() {
        let engine = Engine::default();
        let flow = quiz();
        let mut state = idle();
        state.enter(FlowId::from("quiz"), StepId::from("q1"));

        let evaluation = engine
            .evaluate(&flow, &state, &InboundEvent::parse(user(), "/quiz"))
            .expect("restart");
        assert_eq!(evaluation.outcome, Outcome::AwaitingInput);
        assert_eq!(texts(&evaluation), vec!["Pick A or B"]);
    }

    #[test]
    fn position_in_another_flow_is_not_resumed() {
        let mut state = idle();
        state.enter(FlowId::from("survey"), StepId::from("q1"));

        let evaluation = Engine::default()
            .evaluate(&quiz(), &state, &InboundEvent::text(user(), "A"))
            .expect("evaluate");
        assert_eq!(evaluation.outcome, Outcome::Ignored);
        assert_eq!(evaluation.state.current_flow_id, Some(FlowId::from("survey")));
    }

    #[test]
    fn stale_position_is_reset() {
        let mut state = idle();
        state.enter(FlowId::from("quiz"), StepId::from("removed"));

        let evaluation = Engine::default()
            .evaluate(&quiz(), &state, &InboundEvent::text(user(), "A"))
            .expect("evaluate");
        assert_eq!(evaluation.outcome, Outcome::Reset);
        assert!(evaluation.state.is_idle());
    }

    #[test]
    fn message_cycle_is_detected() {
        let flow = FlowGraph::new(
            "spin",
            "/spin",
            vec![
                Step::message("a", "tick", "b"),
                Step::message("b", "tock", "a"),
            ],
        );
        let engine = Engine::new(EngineLimits {
            max_steps_per_event: 10,
        });

        let err = engine
            .evaluate(&flow, &idle(), &InboundEvent::parse(user(), "/spin"))
            .unwrap_err();
        assert!(matches!(
            err,
            EvaluationError::FlowLoopDetected { limit: 10, .. }
        ));
    }

    #[test]
    fn chain_at_the_limit_completes() {
        let flow = FlowGraph::new(
            "chain",
            "/chain",
            vec![
                Step::message("a", "1", "b"),
                Step::message("b", "2", "c"),
                Step::message("c", "3", TERMINAL_STEP_ID),
            ],
        );
        let engine = Engine::new(EngineLimits {
            max_steps_per_event: 3,
        });

        let evaluation = engine
            .evaluate(&flow, &idle(), &InboundEvent::parse(user(), "/chain"))
            .expect("exactly at the limit");
        assert_eq!(texts(&evaluation), vec!["1", "2", "3"]);
    }

    #[test]
    fn cycle_through_prompt_is_fine() {
        let flow = FlowGraph::new(
            "again",
            "/again",
            vec![
                Step::message("hello", "Hello!", "ask"),
                Step::prompt(
                    "ask",
                    "Again?",
                    vec![
                        FlowOption::new("yes", "hello"),
                        FlowOption::new("no", TERMINAL_STEP_ID),
                    ],
                ),
            ],
        );
        let engine = Engine::default();
        let mut state = idle();

        let evaluation = engine
            .evaluate(&flow, &state, &InboundEvent::parse(user(), "/again"))
            .expect("start");
        state = evaluation.state;
        for _ in 0..3 {
            let evaluation = engine
                .evaluate(&flow, &state, &InboundEvent::text(user(), "yes"))
                .expect("loop");
            assert_eq!(texts(&evaluation), vec!["Hello!", "Again?"]);
            state = evaluation.state;
        }

        let done = engine
            .evaluate(&flow, &state, &InboundEvent::text(user(), "no"))
            .expect("finish");
        assert_eq!(done.outcome, Outcome::Completed);
        assert!(done.actions.is_empty());
    }

    #[test]
    fn branch_routes_on_stored_answer() {
        let flow = FlowGraph::new(
            "plan",
            "/plan",
            vec![
                Step::prompt(
                    "size",
                    "Team size?",
                    vec![
                        FlowOption::new("solo", "route"),
                        FlowOption::new("team", "route"),
                    ],
                )
                .storing_as("size"),
                Step::branch(
                    "route",
                    "size",
                    vec![FlowOption::new("team", "team_plan")],
                    "solo_plan",
                ),
                Step::message("team_plan", "Try the team plan", TERMINAL_STEP_ID),
                Step::message("solo_plan", "Try the solo plan", TERMINAL_STEP_ID),
            ],
        );
        let engine = Engine::default();
        let waiting = engine
            .evaluate(&flow, &idle(), &InboundEvent::parse(user(), "/plan"))
            .expect("start")
            .state;

        let team = engine
            .evaluate(&flow, &waiting, &InboundEvent::text(user(), "team"))
            .expect("team");
        assert_eq!(texts(&team), vec!["Try the team plan"]);

        let solo = engine
            .evaluate(&flow, &waiting, &InboundEvent::text(user(), "solo"))
            .expect("solo");
        assert_eq!(texts(&solo), vec!["Try the solo plan"]);
    }

    #[test]
    fn evaluation_does_not_touch_input_state() {
        let engine = Engine::default();
        let state = idle();
        let before = state.clone();
        let _ = engine.evaluate(&quiz(), &state, &InboundEvent::parse(user(), "/quiz"));
        assert_eq!(state, before);
    }
}
