//! The map of live bot instances.
//!
//! The registry is the only place a started instance can be found. Reads
//! take a shared lock and never see an instance that is still connecting:
//! entries are inserted only after launch succeeds. Lifecycle operations
//! for the same bot are mutually exclusive; a second one fails fast with
//! [`RuntimeError::AlreadyDeploying`] instead of queueing.

use crate::error::RuntimeError;
use crate::instance::{BotInstance, InstanceSummary, Launcher};
use botwright_core::{BotId, InstanceId};
use botwright_flow::BotDefinition;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::instrument;

/// Concurrency-safe map from bot id to its running instance.
pub struct Registry {
    launcher: Launcher,
    entries: RwLock<HashMap<BotId, Arc<BotInstance>>>,
    in_progress: Mutex<HashSet<BotId>>,
}

/// Marks a bot as busy for the lifetime of a lifecycle operation.
struct Claim<'a> {
    registry: &'a Registry,
    bot_id: BotId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.registry
            .in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.bot_id);
    }
}

impl Registry {
    pub(crate) fn new(launcher: Launcher) -> Self {
        Self {
            launcher,
            entries: RwLock::new(HashMap::new()),
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn launcher(&self) -> &Launcher {
        &self.launcher
    }

    fn claim(&self, bot_id: &BotId) -> Result<Claim<'_>, RuntimeError> {
        let mut busy = self
            .in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !busy.insert(bot_id.clone()) {
            return Err(RuntimeError::AlreadyDeploying {
                bot_id: bot_id.clone(),
            });
        }
        Ok(Claim {
            registry: self,
            bot_id: bot_id.clone(),
        })
    }

    pub(crate) fn get(&self, bot_id: &BotId) -> Option<Arc<BotInstance>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(bot_id)
            .cloned()
    }

    fn remove(&self, bot_id: &BotId) -> Option<Arc<BotInstance>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(bot_id)
    }

    /// Starts an instance for an already validated definition, stopping
    /// any existing instance for the bot first.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::AlreadyDeploying`] if another lifecycle
    /// operation for the bot is running, or the launch error. When the
    /// launch fails after a previous instance was stopped, the bot is left
    /// undeployed.
    #[instrument(skip_all, fields(bot_id = %definition.id))]
    pub async fn deploy(&self, definition: Arc<BotDefinition>) -> Result<InstanceId, RuntimeError> {
        self.deploy_inner(definition, false).await
    }

    pub(crate) async fn deploy_inner(
        &self,
        definition: Arc<BotDefinition>,
        auto_redeployed: bool,
    ) -> Result<InstanceId, RuntimeError> {
        let bot_id = definition.id.clone();
        let _claim = self.claim(&bot_id)?;

        if let Some(previous) = self.get(&bot_id) {
            tracing::info!(previous_instance = %previous.id(), "stopping previous instance");
            // The old entry stays visible, reporting `stopping`, until it is
            // fully drained.
            previous.stop().await?;
            self.remove(&bot_id);
        }

        let instance = self.launcher.launch(definition, auto_redeployed).await?;
        let instance_id = instance.id();
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(bot_id, instance);

        Ok(instance_id)
    }

    /// Stops and removes the bot's instance.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotDeployed`] if no instance exists, or
    /// [`RuntimeError::AlreadyDeploying`] if another lifecycle operation
    /// for the bot is running.
    #[instrument(skip(self))]
    pub async fn undeploy(&self, bot_id: &BotId) -> Result<InstanceSummary, RuntimeError> {
        let _claim = self.claim(bot_id)?;

        let instance = self.get(bot_id).ok_or_else(|| RuntimeError::NotDeployed {
            bot_id: bot_id.clone(),
        })?;
        instance.stop().await?;
        self.remove(bot_id);

        Ok(instance.summary())
    }

    /// Returns the summary of the bot's instance.
    #[must_use]
    pub fn lookup(&self, bot_id: &BotId) -> Option<InstanceSummary> {
        self.get(bot_id).map(|instance| instance.summary())
    }

    /// Summaries of every registered instance, ordered by bot id.
    #[must_use]
    pub fn list_active(&self) -> Vec<InstanceSummary> {
        let mut summaries: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|instance| instance.summary())
            .collect();
        summaries.sort_by(|a, b| a.bot_id.cmp(&b.bot_id));
        summaries
    }

    /// Ids of every registered bot.
    pub(crate) fn bot_ids(&self) -> Vec<BotId> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceStatus;
    use crate::memory::{InMemoryStateStore, InMemoryTransport};
    use crate::settings::RuntimeSettings;
    use botwright_flow::{Command, TransportCredential};
    use tokio::sync::mpsc;

    fn bot_id() -> BotId {
        "echo".parse().unwrap()
    }

    fn definition(reply: &str) -> Arc<BotDefinition> {
        Arc::new(
            BotDefinition::new(bot_id(), "Echo", TransportCredential::new("t"))
                .with_command(Command::new("ping", reply)),
        )
    }

    fn registry() -> (Registry, InMemoryTransport) {
        let transport = InMemoryTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let launcher = Launcher::new(
            Arc::new(transport.clone()),
            Arc::new(InMemoryStateStore::new()),
            Arc::new(RuntimeSettings::default()),
            tx,
        );
        (Registry::new(launcher), transport)
    }

    #[tokio::test]
    async fn deploy_registers_a_running_instance() {
        let (registry, transport) = registry();
        let id = registry.deploy(definition("pong")).await.unwrap();

        let summary = registry.lookup(&bot_id()).unwrap();
        assert_eq!(summary.instance_id, id);
        assert_eq!(summary.status, InstanceStatus::Running);
        assert_eq!(summary.name, "Echo");
        assert_eq!(transport.live_subscriptions(&bot_id()), 1);
    }

    #[tokio::test]
    async fn redeploy_replaces_the_instance() {
        let (registry, transport) = registry();
        let first = registry.deploy(definition("one")).await.unwrap();
        let second = registry.deploy(definition("two")).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(registry.list_active().len(), 1);
        assert_eq!(registry.lookup(&bot_id()).unwrap().instance_id, second);
        assert_eq!(transport.subscriptions_opened(&bot_id()), 2);
        assert_eq!(transport.live_subscriptions(&bot_id()), 1);
    }

    #[tokio::test]
    async fn undeploy_unknown_bot_leaves_registry_unchanged() {
        let (registry, _transport) = registry();
        registry.deploy(definition("pong")).await.unwrap();

        let other: BotId = "ghost".parse().unwrap();
        let err = registry.undeploy(&other).await.unwrap_err();
        assert_eq!(err, RuntimeError::NotDeployed { bot_id: other });
        assert_eq!(registry.list_active().len(), 1);
    }

    #[tokio::test]
    async fn second_undeploy_fails_cleanly() {
        let (registry, transport) = registry();
        registry.deploy(definition("pong")).await.unwrap();

        let summary = registry.undeploy(&bot_id()).await.unwrap();
        assert_eq!(summary.status, InstanceStatus::Stopped);
        assert_eq!(transport.live_subscriptions(&bot_id()), 0);

        assert!(matches!(
            registry.undeploy(&bot_id()).await,
            Err(RuntimeError::NotDeployed { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_operations_on_one_bot_are_refused() {
        let (registry, _transport) = registry();
        let _claim = registry.claim(&bot_id()).unwrap();

        assert_eq!(
            registry.deploy(definition("pong")).await,
            Err(RuntimeError::AlreadyDeploying { bot_id: bot_id() })
        );
        assert!(matches!(
            registry.undeploy(&bot_id()).await,
            Err(RuntimeError::AlreadyDeploying { .. })
        ));
    }

    #[tokio::test]
    async fn failed_launch_registers_nothing() {
        let (registry, transport) = registry();
        transport.refuse_subscriptions(&bot_id());

        assert!(registry.deploy(definition("pong")).await.is_err());
        assert!(registry.lookup(&bot_id()).is_none());
        // The claim was released.
        assert!(registry.claim(&bot_id()).is_ok());
    }
}
