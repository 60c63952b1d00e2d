//! In-memory collaborators.
//!
//! Used by the tests in this workspace and by embedders that want a
//! runtime without NATS. Each one also exposes controls for injecting
//! traffic and failures.

use crate::source::{DefinitionSource, SourceError};
use crate::store::{StateStore, StoreError};
use crate::transport::{InboundStream, Transport, TransportError};
use async_trait::async_trait;
use botwright_core::{BotId, ChatUserId};
use botwright_flow::{
    BotDefinition, ConversationState, DesiredStatus, InboundEvent, OutboundAction,
    TransportCredential,
};
use futures::Stream;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State store backed by a map.
#[derive(Default)]
pub struct InMemoryStateStore {
    states: Mutex<HashMap<(BotId, ChatUserId), ConversationState>>,
    latency: Mutex<Duration>,
    unavailable: Mutex<bool>,
}

impl InMemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Makes every operation fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        *lock(&self.unavailable) = unavailable;
    }

    /// Returns the stored state without the default fallback.
    #[must_use]
    pub fn get(&self, bot_id: &BotId, user_id: &ChatUserId) -> Option<ConversationState> {
        lock(&self.states)
            .get(&(bot_id.clone(), user_id.clone()))
            .cloned()
    }

    /// Number of stored states.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.states).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn delay(&self) -> Result<(), StoreError> {
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if *lock(&self.unavailable) {
            return Err(StoreError::Unavailable {
                message: "in-memory store switched off".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load_state(
        &self,
        bot_id: &BotId,
        user_id: &ChatUserId,
    ) -> Result<ConversationState, StoreError> {
        self.delay().await?;
        Ok(self
            .get(bot_id, user_id)
            .unwrap_or_else(|| ConversationState::new(bot_id.clone(), user_id.clone())))
    }

    async fn save_state(&self, state: &ConversationState) -> Result<(), StoreError> {
        self.delay().await?;
        lock(&self.states).insert(
            (state.bot_id.clone(), state.user_id.clone()),
            state.clone(),
        );
        Ok(())
    }

    async fn clear_bot(&self, bot_id: &BotId) -> Result<u64, StoreError> {
        self.delay().await?;
        let mut states = lock(&self.states);
        let before = states.len();
        states.retain(|(bot, _), _| bot != bot_id);
        Ok((before - states.len()) as u64)
    }
}

/// Definition source backed by a map.
#[derive(Default)]
pub struct InMemoryDefinitionSource {
    definitions: Mutex<HashMap<BotId, BotDefinition>>,
    unavailable: Mutex<bool>,
}

impl InMemoryDefinitionSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a definition.
    pub fn insert(&self, definition: BotDefinition) {
        lock(&self.definitions).insert(definition.id.clone(), definition);
    }

    /// Makes every request fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        *lock(&self.unavailable) = unavailable;
    }

    fn check(&self) -> Result<(), SourceError> {
        if *lock(&self.unavailable) {
            return Err(SourceError::RequestFailed {
                message: "in-memory source switched off".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DefinitionSource for InMemoryDefinitionSource {
    async fn get_bot_definition(&self, bot_id: &BotId) -> Result<BotDefinition, SourceError> {
        self.check()?;
        lock(&self.definitions)
            .get(bot_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound {
                bot_id: bot_id.clone(),
            })
    }

    async fn list_active_definitions(&self) -> Result<Vec<BotDefinition>, SourceError> {
        self.check()?;
        let mut active: Vec<_> = lock(&self.definitions)
            .values()
            .filter(|d| d.desired_status == DesiredStatus::Active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }
}

/// An action recorded by [`InMemoryTransport::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentAction {
    pub bot_id: BotId,
    pub user_id: ChatUserId,
    pub action: OutboundAction,
}

#[derive(Default)]
struct TransportInner {
    inbound: HashMap<BotId, (u64, mpsc::UnboundedSender<InboundEvent>)>,
    next_subscription: u64,
    opened: HashMap<BotId, usize>,
    live: HashMap<BotId, usize>,
    refused: HashSet<BotId>,
    sent: Vec<SentAction>,
    failing_sends: u32,
}

/// Transport that delivers injected events and records sent actions.
#[derive(Default, Clone)]
pub struct InMemoryTransport {
    inner: Arc<Mutex<TransportInner>>,
}

impl InMemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers an event to the bot's current subscription.
    ///
    /// Returns false if the bot has no subscription.
    pub fn inject(&self, bot_id: &BotId, event: InboundEvent) -> bool {
        lock(&self.inner)
            .inbound
            .get(bot_id)
            .is_some_and(|(_, sender)| sender.send(event).is_ok())
    }

    /// Ends the bot's current subscription as if the connection dropped.
    pub fn disconnect(&self, bot_id: &BotId) {
        lock(&self.inner).inbound.remove(bot_id);
    }

    /// Makes subscribe fail for the bot.
    pub fn refuse_subscriptions(&self, bot_id: &BotId) {
        lock(&self.inner).refused.insert(bot_id.clone());
    }

    /// Makes the next `count` sends fail.
    pub fn fail_next_sends(&self, count: u32) {
        lock(&self.inner).failing_sends = count;
    }

    /// Everything sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<SentAction> {
        lock(&self.inner).sent.clone()
    }

    /// Texts sent to one user, in order.
    #[must_use]
    pub fn texts_to(&self, user_id: &ChatUserId) -> Vec<String> {
        lock(&self.inner)
            .sent
            .iter()
            .filter(|s| &s.user_id == user_id)
            .map(|s| s.action.text().to_string())
            .collect()
    }

    /// Waits until at least `count` actions have been sent, or a few
    /// seconds have passed, and returns what was sent.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<SentAction> {
        for _ in 0..400 {
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.sent()
    }

    /// Subscription streams for the bot that have not been dropped.
    #[must_use]
    pub fn live_subscriptions(&self, bot_id: &BotId) -> usize {
        lock(&self.inner).live.get(bot_id).copied().unwrap_or(0)
    }

    /// Subscriptions ever opened for the bot.
    #[must_use]
    pub fn subscriptions_opened(&self, bot_id: &BotId) -> usize {
        lock(&self.inner).opened.get(bot_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn subscribe(
        &self,
        bot_id: &BotId,
        _credential: &TransportCredential,
    ) -> Result<InboundStream, TransportError> {
        let mut inner = lock(&self.inner);
        if inner.refused.contains(bot_id) {
            return Err(TransportError::SubscribeFailed {
                message: format!("subscription refused for {bot_id}"),
            });
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        inner.next_subscription += 1;
        let id = inner.next_subscription;
        inner.inbound.insert(bot_id.clone(), (id, sender));
        *inner.opened.entry(bot_id.clone()).or_default() += 1;
        *inner.live.entry(bot_id.clone()).or_default() += 1;
        drop(inner);

        Ok(Box::pin(MemorySubscription {
            bot_id: bot_id.clone(),
            id,
            receiver,
            transport: Arc::clone(&self.inner),
        }))
    }

    async fn send(
        &self,
        bot_id: &BotId,
        user_id: &ChatUserId,
        action: &OutboundAction,
    ) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        if inner.failing_sends > 0 {
            inner.failing_sends -= 1;
            return Err(TransportError::SendFailed {
                message: "injected send failure".to_string(),
            });
        }
        inner.sent.push(SentAction {
            bot_id: bot_id.clone(),
            user_id: user_id.clone(),
            action: action.clone(),
        });
        Ok(())
    }
}

struct MemorySubscription {
    bot_id: BotId,
    id: u64,
    receiver: mpsc::UnboundedReceiver<InboundEvent>,
    transport: Arc<Mutex<TransportInner>>,
}

impl Stream for MemorySubscription {
    type Item = InboundEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        let mut inner = lock(&self.transport);
        if let Some(live) = inner.live.get_mut(&self.bot_id) {
            *live = live.saturating_sub(1);
        }
        if inner
            .inbound
            .get(&self.bot_id)
            .is_some_and(|(id, _)| *id == self.id)
        {
            inner.inbound.remove(&self.bot_id);
        }
    }
}
