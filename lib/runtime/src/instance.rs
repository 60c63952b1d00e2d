//! Running bot instances.
//!
//! An instance owns one transport subscription and one worker task that
//! pulls inbound events off it. The worker does no processing itself: it
//! hands each event to the sending user's lane, so one user's events apply
//! strictly in arrival order while different users proceed in parallel.
//!
//! Processing an event:
//! 1. A command found in the bot's command table is answered with its
//!    static response. Conversation state is not touched.
//! 2. Otherwise the user's state is loaded, the flow to evaluate is chosen
//!    (a triggered flow first, then the user's current flow) and the engine
//!    runs.
//! 3. The new state is saved, then the actions are delivered. If delivery
//!    fails after all retries, the previous state is written back so the
//!    event counts as not applied.

use crate::error::RuntimeError;
use crate::lanes::{LaneHandler, Lanes};
use crate::settings::RuntimeSettings;
use crate::store::StateStore;
use crate::transport::{InboundStream, Transport, TransportError};
use async_trait::async_trait;
use botwright_core::{BotId, ChatUserId, InstanceId};
use botwright_flow::{
    BotDefinition, ConversationState, Engine, EvaluationError, InboundEvent, OutboundAction,
    Outcome,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Connecting to the transport.
    Starting,
    /// Accepting events.
    Running,
    /// Draining; new events are rejected.
    Stopping,
    /// Fully shut down.
    Stopped,
    /// The transport connection was lost.
    Failed,
}

impl InstanceStatus {
    /// Returns true if the lifecycle allows moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Running | Self::Failed | Self::Stopping)
                | (Self::Running, Self::Stopping | Self::Failed)
                | (Self::Failed, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
        )
    }

    /// Returns true if events are processed in this status.
    #[must_use]
    pub fn accepts_events(self) -> bool {
        self == Self::Running
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Read-only view of a deployed instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub bot_id: BotId,
    pub instance_id: InstanceId,
    pub name: String,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
}

/// How an event is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// Command table first, then flows.
    Auto,
    /// Flows only.
    FlowOnly,
}

enum Reply {
    /// Deliver actions through the transport.
    Transport,
    /// Hand actions back to a caller instead of delivering them.
    Caller(oneshot::Sender<Result<Vec<OutboundAction>, RuntimeError>>),
}

pub(crate) struct Job {
    event: InboundEvent,
    route: Route,
    reply: Reply,
}

impl Job {
    fn reject(self, bot_id: &BotId, error: RuntimeError) {
        match self.reply {
            Reply::Caller(sender) => {
                let _ = sender.send(Err(error));
            }
            Reply::Transport => {
                tracing::warn!(
                    %bot_id,
                    user_id = %self.event.user_id,
                    error = %error,
                    "inbound event rejected"
                );
            }
        }
    }
}

/// Reported to the supervisor when an instance loses its transport.
#[derive(Debug, Clone)]
pub(crate) struct InstanceFailure {
    pub bot_id: BotId,
    pub instance_id: InstanceId,
    pub error: TransportError,
}

/// Builds instances that share one set of collaborators.
#[derive(Clone)]
pub(crate) struct Launcher {
    transport: Arc<dyn Transport>,
    store: Arc<dyn StateStore>,
    settings: Arc<RuntimeSettings>,
    failures: mpsc::UnboundedSender<InstanceFailure>,
}

impl Launcher {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn StateStore>,
        settings: Arc<RuntimeSettings>,
        failures: mpsc::UnboundedSender<InstanceFailure>,
    ) -> Self {
        Self {
            transport,
            store,
            settings,
            failures,
        }
    }

    pub(crate) fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub(crate) fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Subscribes to the transport and starts the worker.
    ///
    /// The definition must already be validated.
    #[instrument(skip_all, fields(bot_id = %definition.id))]
    pub(crate) async fn launch(
        &self,
        definition: Arc<BotDefinition>,
        auto_redeployed: bool,
    ) -> Result<Arc<BotInstance>, RuntimeError> {
        let core = Arc::new(InstanceCore {
            bot_id: definition.id.clone(),
            instance_id: InstanceId::new(),
            engine: Engine::new(self.settings.engine_limits()),
            status: Mutex::new(InstanceStatus::Starting),
            lanes: Lanes::new(self.settings.lane_idle()),
            transport: Arc::clone(&self.transport),
            store: Arc::clone(&self.store),
            settings: Arc::clone(&self.settings),
            definition,
        });

        let stream = match self
            .transport
            .subscribe(&core.bot_id, &core.definition.transport_credential)
            .await
        {
            Ok(stream) => stream,
            Err(error) => {
                core.transition(InstanceStatus::Failed)?;
                return Err(RuntimeError::Transport {
                    bot_id: core.bot_id.clone(),
                    error,
                });
            }
        };

        core.transition(InstanceStatus::Running)?;

        let instance = Arc::new(BotInstance {
            core: Arc::clone(&core),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            worker: TaskTracker::new(),
            auto_redeployed,
        });
        instance.worker.spawn(pump(
            core,
            stream,
            instance.cancel.clone(),
            self.failures.clone(),
        ));

        tracing::info!(instance_id = %instance.id(), "instance running");
        Ok(instance)
    }
}

/// One deployed bot.
pub struct BotInstance {
    core: Arc<InstanceCore>,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    worker: TaskTracker,
    auto_redeployed: bool,
}

impl fmt::Debug for BotInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotInstance")
            .field("bot_id", &self.core.bot_id)
            .field("instance_id", &self.core.instance_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl BotInstance {
    #[must_use]
    pub fn id(&self) -> InstanceId {
        self.core.instance_id
    }

    #[must_use]
    pub fn bot_id(&self) -> &BotId {
        &self.core.bot_id
    }

    #[must_use]
    pub fn definition(&self) -> &Arc<BotDefinition> {
        &self.core.definition
    }

    #[must_use]
    pub fn status(&self) -> InstanceStatus {
        self.core.status()
    }

    /// True if this instance was started by the supervisor after a failure
    /// rather than by a deploy request.
    #[must_use]
    pub fn is_auto_redeploy(&self) -> bool {
        self.auto_redeployed
    }

    #[must_use]
    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            bot_id: self.core.bot_id.clone(),
            instance_id: self.core.instance_id,
            name: self.core.definition.name.clone(),
            status: self.status(),
            started_at: self.started_at,
        }
    }

    /// Queues an event for delivery through the transport.
    pub(crate) fn route(&self, event: InboundEvent) -> Result<(), RuntimeError> {
        self.core.ensure_running()?;
        self.core.dispatch(Job {
            event,
            route: Route::Auto,
            reply: Reply::Transport,
        });
        Ok(())
    }

    /// Processes an event in its user's lane and returns the actions
    /// instead of sending them.
    pub(crate) async fn call(
        &self,
        event: InboundEvent,
        route: Route,
    ) -> Result<Vec<OutboundAction>, RuntimeError> {
        self.core.ensure_running()?;
        let (sender, receiver) = oneshot::channel();
        self.core.dispatch(Job {
            event,
            route,
            reply: Reply::Caller(sender),
        });
        receiver.await.map_err(|_| RuntimeError::BotUnavailable {
            bot_id: self.core.bot_id.clone(),
            status: self.status(),
        })?
    }

    /// Cancels the subscription, lets in-flight events finish and rejects
    /// anything still queued.
    #[instrument(skip_all, fields(bot_id = %self.core.bot_id, instance_id = %self.core.instance_id))]
    pub(crate) async fn stop(&self) -> Result<(), RuntimeError> {
        self.core.transition(InstanceStatus::Stopping)?;

        self.cancel.cancel();
        self.worker.close();
        self.worker.wait().await;

        self.core.lanes.close();
        self.core.lanes.drained().await;

        self.core.transition(InstanceStatus::Stopped)?;
        tracing::info!("instance stopped");
        Ok(())
    }
}

async fn pump(
    core: Arc<InstanceCore>,
    mut stream: InboundStream,
    cancel: CancellationToken,
    failures: mpsc::UnboundedSender<InstanceFailure>,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(event) => {
                    if let Err(error) = core.ensure_running() {
                        Job { event, route: Route::Auto, reply: Reply::Transport }
                            .reject(&core.bot_id, error);
                        continue;
                    }
                    core.dispatch(Job { event, route: Route::Auto, reply: Reply::Transport });
                }
                None => {
                    if core.transition(InstanceStatus::Failed).is_ok() {
                        let error = TransportError::ConnectionFailed {
                            message: "inbound stream ended".to_string(),
                        };
                        tracing::error!(
                            bot_id = %core.bot_id,
                            instance_id = %core.instance_id,
                            error = %error,
                            "transport connection lost"
                        );
                        let _ = failures.send(InstanceFailure {
                            bot_id: core.bot_id.clone(),
                            instance_id: core.instance_id,
                            error,
                        });
                    }
                    break;
                }
            }
        }
    }
}

struct InstanceCore {
    bot_id: BotId,
    instance_id: InstanceId,
    definition: Arc<BotDefinition>,
    engine: Engine,
    status: Mutex<InstanceStatus>,
    lanes: Lanes<ChatUserId, Job>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn StateStore>,
    settings: Arc<RuntimeSettings>,
}

/// What processing produced.
struct Processed {
    actions: Vec<OutboundAction>,
    /// The state before the event, if state was touched.
    previous: Option<ConversationState>,
}

impl InstanceCore {
    fn lock_status(&self) -> MutexGuard<'_, InstanceStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> InstanceStatus {
        *self.lock_status()
    }

    fn transition(&self, to: InstanceStatus) -> Result<InstanceStatus, RuntimeError> {
        let mut status = self.lock_status();
        let from = *status;
        if !from.can_transition_to(to) {
            return Err(RuntimeError::InvalidStateTransition {
                bot_id: self.bot_id.clone(),
                from,
                to,
            });
        }
        *status = to;
        drop(status);
        tracing::debug!(bot_id = %self.bot_id, %from, %to, "instance status changed");
        Ok(from)
    }

    fn ensure_running(&self) -> Result<(), RuntimeError> {
        let status = self.status();
        if status.accepts_events() {
            Ok(())
        } else {
            Err(RuntimeError::BotUnavailable {
                bot_id: self.bot_id.clone(),
                status,
            })
        }
    }

    fn dispatch(self: &Arc<Self>, job: Job) {
        let user_id = job.event.user_id.clone();
        if let Err(job) = self.lanes.submit(user_id, job, self) {
            job.reject(&self.bot_id, RuntimeError::BotUnavailable {
                bot_id: self.bot_id.clone(),
                status: self.status(),
            });
        }
    }

    async fn process(
        &self,
        event: &InboundEvent,
        route: Route,
    ) -> Result<Processed, RuntimeError> {
        let definition = &self.definition;

        if route == Route::Auto
            && let Some(name) = event.command_name()
            && let Some(command) = definition.command(name)
        {
            return Ok(Processed {
                actions: vec![OutboundAction::reply(command.response.clone())],
                previous: None,
            });
        }

        let previous = self.load(&event.user_id).await?;
        let mut state = previous.clone();

        if let Some(flow_id) = &state.current_flow_id
            && definition.flow(flow_id).is_none()
        {
            tracing::debug!(user_id = %event.user_id, %flow_id, "resetting position in a flow that no longer exists");
            state.clear_position();
        }

        let flow = definition.triggered_flow(event).or_else(|| {
            state
                .current_flow_id
                .as_ref()
                .and_then(|id| definition.flow(id))
        });

        let mut actions = Vec::new();
        let mut handled = false;
        if let Some(flow) = flow {
            match self.engine.evaluate(flow, &state, event) {
                Ok(evaluation) => {
                    handled = evaluation.outcome != Outcome::Ignored;
                    state = evaluation.state;
                    actions = evaluation.actions;
                }
                Err(EvaluationError::FlowLoopDetected { flow_id, limit, .. }) => {
                    state.clear_position();
                    state.touch(Utc::now());
                    self.save(&state).await?;
                    return Err(RuntimeError::FlowLoopDetected {
                        bot_id: self.bot_id.clone(),
                        user_id: event.user_id.clone(),
                        flow_id,
                        limit,
                    });
                }
                Err(error) => {
                    return Err(RuntimeError::Evaluation {
                        bot_id: self.bot_id.clone(),
                        error,
                    });
                }
            }
        }

        if !handled
            && route == Route::Auto
            && let Some(name) = event.command_name()
        {
            actions.push(OutboundAction::reply(RuntimeSettings::unknown_command(name)));
        }

        state.touch(Utc::now());
        self.save(&state).await?;

        Ok(Processed {
            actions,
            previous: Some(previous),
        })
    }

    async fn load(&self, user_id: &ChatUserId) -> Result<ConversationState, RuntimeError> {
        match tokio::time::timeout(
            self.settings.persistence_timeout(),
            self.store.load_state(&self.bot_id, user_id),
        )
        .await
        {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(error)) => Err(RuntimeError::Store {
                bot_id: self.bot_id.clone(),
                error,
            }),
            Err(_) => Err(RuntimeError::PersistenceTimeout {
                bot_id: self.bot_id.clone(),
                user_id: user_id.clone(),
            }),
        }
    }

    async fn save(&self, state: &ConversationState) -> Result<(), RuntimeError> {
        match tokio::time::timeout(
            self.settings.persistence_timeout(),
            self.store.save_state(state),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(RuntimeError::Store {
                bot_id: self.bot_id.clone(),
                error,
            }),
            Err(_) => Err(RuntimeError::PersistenceTimeout {
                bot_id: self.bot_id.clone(),
                user_id: state.user_id.clone(),
            }),
        }
    }

    async fn send_with_retry(
        &self,
        user_id: &ChatUserId,
        action: &OutboundAction,
    ) -> Result<(), TransportError> {
        let attempts = self.settings.send_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.transport.send(&self.bot_id, user_id, action).await {
                Ok(()) => return Ok(()),
                Err(error) if attempt < attempts => {
                    tracing::debug!(
                        bot_id = %self.bot_id,
                        %user_id,
                        attempt,
                        error = %error,
                        "send failed, retrying"
                    );
                    tokio::time::sleep(self.settings.send_backoff(attempt)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn deliver(&self, event: InboundEvent, route: Route) {
        let user_id = event.user_id.clone();
        let processed = match self.process(&event, route).await {
            Ok(processed) => processed,
            Err(error) => {
                tracing::warn!(bot_id = %self.bot_id, %user_id, error = %error, "event not applied");
                if let Some(text) = error.user_message(&self.settings)
                    && let Err(send_error) = self
                        .send_with_retry(&user_id, &OutboundAction::reply(text))
                        .await
                {
                    tracing::warn!(bot_id = %self.bot_id, %user_id, error = %send_error, "could not notify user");
                }
                return;
            }
        };

        for action in &processed.actions {
            if let Err(error) = self.send_with_retry(&user_id, action).await {
                tracing::error!(
                    bot_id = %self.bot_id,
                    %user_id,
                    error = %error,
                    "dropping reply after retries"
                );
                if let Some(previous) = &processed.previous
                    && let Err(restore_error) = self.save(previous).await
                {
                    tracing::error!(
                        bot_id = %self.bot_id,
                        %user_id,
                        error = %restore_error,
                        "could not restore state after failed delivery"
                    );
                }
                return;
            }
        }
    }
}

#[async_trait]
impl LaneHandler<Job> for InstanceCore {
    async fn handle(&self, job: Job) {
        if let Err(error) = self.ensure_running() {
            job.reject(&self.bot_id, error);
            return;
        }

        match job.reply {
            Reply::Transport => self.deliver(job.event, job.route).await,
            Reply::Caller(sender) => {
                let result = self
                    .process(&job.event, job.route)
                    .await
                    .map(|processed| processed.actions);
                let _ = sender.send(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryStateStore, InMemoryTransport};
    use botwright_flow::{Command, FlowGraph, FlowOption, Step, TERMINAL_STEP_ID, TransportCredential};
    use std::time::Duration;

    fn bot_id() -> BotId {
        "quiz-bot".parse().unwrap()
    }

    fn user(id: &str) -> ChatUserId {
        id.parse().unwrap()
    }

    fn quiz() -> Arc<BotDefinition> {
        Arc::new(
            BotDefinition::new(bot_id(), "Quiz", TransportCredential::new("t"))
                .with_command(Command::new("help", "Send /quiz to play"))
                .with_flow(FlowGraph::new(
                    "quiz",
                    "/quiz",
                    vec![
                        Step::prompt(
                            "q1",
                            "Pick A or B",
                            vec![FlowOption::new("A", "ra"), FlowOption::new("B", "rb")],
                        ),
                        Step::message("ra", "You picked A", TERMINAL_STEP_ID),
                        Step::message("rb", "You picked B", TERMINAL_STEP_ID),
                    ],
                )),
        )
    }

    struct Harness {
        launcher: Launcher,
        transport: InMemoryTransport,
        store: Arc<InMemoryStateStore>,
        failures: mpsc::UnboundedReceiver<InstanceFailure>,
    }

    fn harness(settings: RuntimeSettings) -> Harness {
        let transport = InMemoryTransport::new();
        let store = Arc::new(InMemoryStateStore::new());
        let (tx, failures) = mpsc::unbounded_channel();
        Harness {
            launcher: Launcher::new(
                Arc::new(transport.clone()),
                store.clone(),
                Arc::new(settings),
                tx,
            ),
            transport,
            store,
            failures,
        }
    }

    #[test]
    fn lifecycle_transitions() {
        use InstanceStatus::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Stopping));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopping.can_transition_to(Running));
        assert!(!Running.can_transition_to(Stopped));
    }

    #[tokio::test]
    async fn quiz_scenario_through_transport() {
        let h = harness(RuntimeSettings::default());
        let instance = h.launcher.launch(quiz(), false).await.unwrap();
        assert_eq!(instance.status(), InstanceStatus::Running);

        let alice = user("alice");
        h.transport
            .inject(&bot_id(), InboundEvent::parse(alice.clone(), "/quiz"));
        h.transport
            .inject(&bot_id(), InboundEvent::parse(alice.clone(), "A"));
        h.transport.wait_for_sent(2).await;

        assert_eq!(
            h.transport.texts_to(&alice),
            vec!["Pick A or B".to_string(), "You picked A".to_string()]
        );
        let state = h.store.get(&bot_id(), &alice).unwrap();
        assert!(state.is_idle());
        assert_eq!(state.current_flow_id, None);

        instance.stop().await.unwrap();
    }

    #[tokio::test]
    async fn commands_bypass_flows_and_state() {
        let h = harness(RuntimeSettings::default());
        let instance = h.launcher.launch(quiz(), false).await.unwrap();

        let actions = instance
            .call(InboundEvent::parse(user("bob"), "/help"), Route::Auto)
            .await
            .unwrap();
        assert_eq!(actions, vec![OutboundAction::reply("Send /quiz to play")]);
        assert!(h.store.is_empty());

        instance.stop().await.unwrap();
    }

    #[tokio::test]
    async fn command_works_while_resting_on_a_prompt() {
        let h = harness(RuntimeSettings::default());
        let instance = h.launcher.launch(quiz(), false).await.unwrap();
        let bob = user("bob");

        instance
            .call(InboundEvent::parse(bob.clone(), "/quiz"), Route::Auto)
            .await
            .unwrap();
        let help = instance
            .call(InboundEvent::parse(bob.clone(), "/help"), Route::Auto)
            .await
            .unwrap();
        assert_eq!(help[0].text(), "Send /quiz to play");

        let answer = instance
            .call(InboundEvent::parse(bob.clone(), "B"), Route::Auto)
            .await
            .unwrap();
        assert_eq!(answer[0].text(), "You picked B");

        instance.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_command_is_reported() {
        let h = harness(RuntimeSettings::default());
        let instance = h.launcher.launch(quiz(), false).await.unwrap();

        let actions = instance
            .call(InboundEvent::parse(user("c"), "/nope"), Route::Auto)
            .await
            .unwrap();
        assert_eq!(actions, vec![OutboundAction::reply("Command /nope not found")]);

        instance.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stale_flow_position_is_reset() {
        let h = harness(RuntimeSettings::default());
        let dave = user("dave");
        let mut stale = ConversationState::new(bot_id(), dave.clone());
        stale.enter("removed".into(), "s1".into());
        h.store.save_state(&stale).await.unwrap();

        let instance = h.launcher.launch(quiz(), false).await.unwrap();
        let actions = instance
            .call(InboundEvent::parse(dave.clone(), "hello"), Route::Auto)
            .await
            .unwrap();
        assert!(actions.is_empty());
        assert!(h.store.get(&bot_id(), &dave).unwrap().is_idle());

        instance.stop().await.unwrap();
    }

    #[tokio::test]
    async fn persistence_timeout_sends_retry_message_and_applies_nothing() {
        let settings = RuntimeSettings {
            persistence_timeout_ms: 20,
            ..RuntimeSettings::default()
        };
        let retry = settings.retry_message.clone();
        let h = harness(settings);
        h.store.set_latency(Duration::from_millis(200));
        let instance = h.launcher.launch(quiz(), false).await.unwrap();

        let erin = user("erin");
        h.transport
            .inject(&bot_id(), InboundEvent::parse(erin.clone(), "/quiz"));
        h.transport.wait_for_sent(1).await;

        assert_eq!(h.transport.texts_to(&erin), vec![retry]);
        h.store.set_latency(Duration::ZERO);
        assert!(h.store.get(&bot_id(), &erin).is_none());

        instance.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_delivery_restores_previous_state() {
        let settings = RuntimeSettings {
            send_attempts: 2,
            send_backoff_ms: 1,
            ..RuntimeSettings::default()
        };
        let h = harness(settings);
        let instance = h.launcher.launch(quiz(), false).await.unwrap();
        let frank = user("frank");

        h.transport.fail_next_sends(2);
        h.transport
            .inject(&bot_id(), InboundEvent::parse(frank.clone(), "/quiz"));

        // The restore lands after the failed sends; poll for it.
        let mut restored = None;
        for _ in 0..200 {
            if let Some(state) = h.store.get(&bot_id(), &frank)
                && state.is_idle()
            {
                restored = Some(state);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(restored.is_some());
        assert!(h.transport.sent().is_empty());

        instance.stop().await.unwrap();
    }

    #[tokio::test]
    async fn retries_hide_transient_send_failures() {
        let settings = RuntimeSettings {
            send_attempts: 3,
            send_backoff_ms: 1,
            ..RuntimeSettings::default()
        };
        let h = harness(settings);
        let instance = h.launcher.launch(quiz(), false).await.unwrap();
        let gina = user("gina");

        h.transport.fail_next_sends(2);
        h.transport
            .inject(&bot_id(), InboundEvent::parse(gina.clone(), "/quiz"));
        h.transport.wait_for_sent(1).await;

        assert_eq!(h.transport.texts_to(&gina), vec!["Pick A or B".to_string()]);
        assert_eq!(
            h.store.get(&bot_id(), &gina).unwrap().current_step_id,
            Some("q1".into())
        );

        instance.stop().await.unwrap();
    }

    #[tokio::test]
    async fn lost_connection_marks_failed_and_reports() {
        let mut h = harness(RuntimeSettings::default());
        let instance = h.launcher.launch(quiz(), false).await.unwrap();

        h.transport.disconnect(&bot_id());
        let failure = tokio::time::timeout(Duration::from_secs(2), h.failures.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(failure.bot_id, bot_id());
        assert_eq!(failure.instance_id, instance.id());
        assert_eq!(instance.status(), InstanceStatus::Failed);

        instance.stop().await.unwrap();
        assert_eq!(instance.status(), InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn refused_subscription_fails_launch() {
        let h = harness(RuntimeSettings::default());
        h.transport.refuse_subscriptions(&bot_id());
        let err = h.launcher.launch(quiz(), false).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Transport { .. }));
    }

    #[tokio::test]
    async fn debug_output_names_the_instance() {
        let h = harness(RuntimeSettings::default());
        let instance = h.launcher.launch(quiz(), false).await.unwrap();
        let debug = format!("{instance:?}");
        assert!(debug.contains("quiz-bot"));
        assert!(debug.contains("Running"));
        instance.stop().await.unwrap();
    }

    #[tokio::test]
    async fn command_payload_with_slash_reaches_table_and_flows() {
        let h = harness(RuntimeSettings::default());
        let instance = h.launcher.launch(quiz(), false).await.unwrap();
        let ivan = user("ivan");

        for payload in ["/help", "/quiz"] {
            let event: InboundEvent = serde_json::from_value(serde_json::json!({
                "user_id": "ivan",
                "kind": "command",
                "payload": payload,
            }))
            .unwrap();
            h.transport.inject(&bot_id(), event);
        }
        h.transport.wait_for_sent(2).await;

        assert_eq!(
            h.transport.texts_to(&ivan),
            vec!["Send /quiz to play".to_string(), "Pick A or B".to_string()]
        );
        instance.stop().await.unwrap();
    }

    #[tokio::test]
    async fn flow_loop_resets_conversation_and_keeps_running() {
        let settings = RuntimeSettings {
            max_steps_per_event: 8,
            ..RuntimeSettings::default()
        };
        let loop_message = settings.loop_message.clone();
        let h = harness(settings);
        let spinner = Arc::new(
            BotDefinition::new(bot_id(), "Spin", TransportCredential::new("t")).with_flow(
                FlowGraph::new(
                    "spin",
                    "/spin",
                    vec![
                        Step::message("a", "tick", "b"),
                        Step::message("b", "tock", "a"),
                    ],
                ),
            ),
        );
        let instance = h.launcher.launch(spinner, false).await.unwrap();
        let jo = user("jo");

        h.transport
            .inject(&bot_id(), InboundEvent::parse(jo.clone(), "/spin"));
        h.transport.wait_for_sent(1).await;

        assert_eq!(h.transport.texts_to(&jo), vec![loop_message]);
        assert!(h.store.get(&bot_id(), &jo).unwrap().is_idle());
        assert_eq!(instance.status(), InstanceStatus::Running);

        instance.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unavailable_store_sends_retry_message() {
        let settings = RuntimeSettings::default();
        let retry = settings.retry_message.clone();
        let h = harness(settings);
        let instance = h.launcher.launch(quiz(), false).await.unwrap();
        let kim = user("kim");

        h.store.set_unavailable(true);
        h.transport
            .inject(&bot_id(), InboundEvent::parse(kim.clone(), "/quiz"));
        h.transport.wait_for_sent(1).await;

        assert_eq!(h.transport.texts_to(&kim), vec![retry]);
        h.store.set_unavailable(false);
        assert!(h.store.get(&bot_id(), &kim).is_none());
        assert_eq!(instance.status(), InstanceStatus::Running);

        instance.stop().await.unwrap();
    }

    #[tokio::test]
    async fn queued_event_is_rejected_once_stopping() {
        let h = harness(RuntimeSettings::default());
        h.store.set_latency(Duration::from_millis(100));
        let instance = h.launcher.launch(quiz(), false).await.unwrap();
        let lee = user("lee");

        h.transport
            .inject(&bot_id(), InboundEvent::parse(lee.clone(), "/quiz"));
        h.transport
            .inject(&bot_id(), InboundEvent::parse(lee.clone(), "A"));
        // Both events are in the lane; the first is waiting on the store.
        tokio::time::sleep(Duration::from_millis(30)).await;

        instance.stop().await.unwrap();
        h.store.set_latency(Duration::ZERO);

        assert_eq!(h.transport.texts_to(&lee), vec!["Pick A or B".to_string()]);
        assert_eq!(
            h.store.get(&bot_id(), &lee).unwrap().current_step_id,
            Some("q1".into())
        );
        assert_eq!(instance.status(), InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn stopped_instance_rejects_events() {
        let h = harness(RuntimeSettings::default());
        let instance = h.launcher.launch(quiz(), false).await.unwrap();
        instance.stop().await.unwrap();

        let err = instance
            .call(InboundEvent::parse(user("h"), "/help"), Route::Auto)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::BotUnavailable {
                status: InstanceStatus::Stopped,
                ..
            }
        ));
        assert_eq!(h.transport.live_subscriptions(&bot_id()), 0);
        assert!(instance.stop().await.is_err());
    }
}
