//! Runtime supervisor.
//!
//! The supervisor is the management surface of the runtime. It validates
//! definitions before they reach the registry, recovers active bots on
//! startup, routes externally ingested events, runs simulations and reacts
//! to instances that lose their transport connection.

use crate::error::RuntimeError;
use crate::instance::{BotInstance, InstanceFailure, InstanceSummary, Launcher, Route};
use crate::registry::Registry;
use crate::settings::RuntimeSettings;
use crate::source::DefinitionSource;
use crate::store::StateStore;
use crate::transport::Transport;
use botwright_core::{BotId, ChatUserId, InstanceId};
use botwright_flow::{BotDefinition, InboundEvent, OutboundAction};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::instrument;

/// Outcome of [`Supervisor::recover`].
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Bots that were deployed.
    pub deployed: Vec<BotId>,
    /// Bots that could not be deployed, with the reason.
    pub failed: Vec<(BotId, RuntimeError)>,
}

/// Owns the registry and the collaborators bots run against.
pub struct Supervisor {
    source: Arc<dyn DefinitionSource>,
    registry: Registry,
}

impl Supervisor {
    /// Creates a supervisor and starts its failure monitor.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        source: Arc<dyn DefinitionSource>,
        store: Arc<dyn StateStore>,
        transport: Arc<dyn Transport>,
        settings: RuntimeSettings,
    ) -> Arc<Self> {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let launcher = Launcher::new(transport, store, Arc::new(settings), failures_tx);
        let supervisor = Arc::new(Self {
            source,
            registry: Registry::new(launcher),
        });
        tokio::spawn(monitor(Arc::downgrade(&supervisor), failures_rx));
        supervisor
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn settings(&self) -> &RuntimeSettings {
        self.registry.launcher().settings()
    }

    /// Validates and deploys a definition.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Validation`] for an invalid definition, in
    /// which case nothing is registered, or any registry error.
    #[instrument(skip_all, fields(bot_id = %definition.id))]
    pub async fn deploy(&self, definition: BotDefinition) -> Result<InstanceId, RuntimeError> {
        definition
            .validate()
            .map_err(|error| RuntimeError::Validation {
                bot_id: definition.id.clone(),
                error,
            })?;

        for flow in &definition.flows {
            let unreachable = flow.unreachable_steps();
            if !unreachable.is_empty() {
                let steps: Vec<&str> = unreachable.iter().map(|s| s.as_str()).collect();
                tracing::warn!(
                    flow_id = %flow.id(),
                    flow_name = flow.name().unwrap_or_default(),
                    ?steps,
                    "flow has unreachable steps"
                );
            }
        }

        let instance_id = self.registry.deploy(Arc::new(definition)).await?;
        tracing::info!(%instance_id, "bot deployed");
        Ok(instance_id)
    }

    /// Fetches a definition from the source and deploys it.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Source`] if the definition cannot be
    /// fetched, otherwise as [`Supervisor::deploy`].
    pub async fn deploy_by_id(&self, bot_id: &BotId) -> Result<InstanceId, RuntimeError> {
        let definition = self.source.get_bot_definition(bot_id).await?;
        self.deploy(definition).await
    }

    /// Undeploys a bot, purging its conversation states if configured to.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotDeployed`] if the bot is not deployed.
    #[instrument(skip(self))]
    pub async fn undeploy(&self, bot_id: &BotId) -> Result<InstanceSummary, RuntimeError> {
        let summary = self.registry.undeploy(bot_id).await?;
        tracing::info!("bot undeployed");

        if self.settings().purge_state_on_undeploy {
            let store = self.registry.launcher().store();
            match tokio::time::timeout(
                self.settings().persistence_timeout(),
                store.clear_bot(bot_id),
            )
            .await
            {
                Ok(Ok(removed)) => tracing::info!(removed, "purged conversation states"),
                Ok(Err(error)) => {
                    tracing::warn!(error = %error, "could not purge conversation states");
                }
                Err(_) => tracing::warn!("purging conversation states timed out"),
            }
        }

        Ok(summary)
    }

    /// Summaries of every deployed bot.
    #[must_use]
    pub fn list_deployed(&self) -> Vec<InstanceSummary> {
        self.registry.list_active()
    }

    #[must_use]
    pub fn lookup(&self, bot_id: &BotId) -> Option<InstanceSummary> {
        self.registry.lookup(bot_id)
    }

    /// Deploys every bot the source lists as active.
    ///
    /// A bot that fails to deploy is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Source`] if the active list cannot be read.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport, RuntimeError> {
        let definitions = self.source.list_active_definitions().await?;
        tracing::info!(count = definitions.len(), "recovering active bots");

        let mut report = RecoveryReport::default();
        for definition in definitions {
            let bot_id = definition.id.clone();
            match self.deploy(definition).await {
                Ok(_) => report.deployed.push(bot_id),
                Err(error) => {
                    tracing::error!(%bot_id, error = %error, "failed to recover bot");
                    report.failed.push((bot_id, error));
                }
            }
        }

        tracing::info!(
            deployed = report.deployed.len(),
            failed = report.failed.len(),
            "recovery finished"
        );
        Ok(report)
    }

    /// Hands an event from an external bridge to a deployed bot.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotDeployed`] or
    /// [`RuntimeError::BotUnavailable`].
    pub fn route(&self, bot_id: &BotId, event: InboundEvent) -> Result<(), RuntimeError> {
        self.instance(bot_id)?.route(event)
    }

    /// Returns what a bot would reply to a command, without touching any
    /// conversation state.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotDeployed`] or
    /// [`RuntimeError::BotUnavailable`].
    pub fn simulate_command(
        &self,
        bot_id: &BotId,
        user_id: &ChatUserId,
        command_name: &str,
    ) -> Result<String, RuntimeError> {
        let instance = self.instance(bot_id)?;
        let status = instance.status();
        if !status.accepts_events() {
            return Err(RuntimeError::BotUnavailable {
                bot_id: bot_id.clone(),
                status,
            });
        }

        let event = InboundEvent::command(user_id.clone(), command_name);
        let name = event.command_name().unwrap_or_default();
        Ok(match instance.definition().command(name) {
            Some(command) => command.response.clone(),
            None => RuntimeSettings::unknown_command(name),
        })
    }

    /// Feeds input to the bot's flows as the given user and returns the
    /// replies. State is loaded and saved exactly as for live traffic.
    ///
    /// # Errors
    ///
    /// Returns any error processing the event would produce.
    pub async fn simulate_flow_step(
        &self,
        bot_id: &BotId,
        user_id: &ChatUserId,
        input: &str,
    ) -> Result<Vec<OutboundAction>, RuntimeError> {
        let event = InboundEvent::parse(user_id.clone(), input);
        self.instance(bot_id)?.call(event, Route::FlowOnly).await
    }

    /// Undeploys every bot. State is never purged here.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        for bot_id in self.registry.bot_ids() {
            if let Err(error) = self.registry.undeploy(&bot_id).await {
                tracing::warn!(%bot_id, error = %error, "failed to stop bot during shutdown");
            }
        }
        tracing::info!("all bots stopped");
    }

    fn instance(&self, bot_id: &BotId) -> Result<Arc<BotInstance>, RuntimeError> {
        self.registry
            .get(bot_id)
            .ok_or_else(|| RuntimeError::NotDeployed {
                bot_id: bot_id.clone(),
            })
    }

    async fn handle_failure(&self, failure: InstanceFailure) {
        let InstanceFailure {
            bot_id,
            instance_id,
            error,
        } = failure;

        if !self.settings().redeploy_on_failure {
            tracing::warn!(%bot_id, %instance_id, error = %error, "instance failed; left for an operator");
            return;
        }

        let Some(instance) = self.registry.get(&bot_id) else {
            return;
        };
        if instance.id() != instance_id {
            return;
        }
        if instance.is_auto_redeploy() {
            tracing::warn!(%bot_id, %instance_id, "redeployed instance failed again; left for an operator");
            return;
        }

        let definition = Arc::clone(instance.definition());
        drop(instance);
        match self.registry.deploy_inner(definition, true).await {
            Ok(new_id) => tracing::info!(%bot_id, %new_id, "redeployed after transport failure"),
            Err(error) => tracing::error!(%bot_id, error = %error, "redeploy after failure failed"),
        }
    }
}

async fn monitor(supervisor: Weak<Supervisor>, mut failures: mpsc::UnboundedReceiver<InstanceFailure>) {
    while let Some(failure) = failures.recv().await {
        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };
        supervisor.handle_failure(failure).await;
    }
}
