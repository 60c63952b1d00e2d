//! NATS collaborators.
//!
//! - [`NatsStateStore`]: conversation state in a JetStream key-value bucket,
//!   one key per (bot, user)
//! - [`NatsTransport`]: inbound events and outbound actions on per-bot
//!   subjects, bridged to the messaging platform by a separate gateway
//!
//! Everything written is wrapped in an [`Envelope`].
//!
//! Subjects, with the default prefix:
//! - `bots.control.attach`: request; asks the gateway to connect a bot
//! - `bots.control.detach`: publish; tells the gateway a bot went away
//! - `bots.<bot_id>.inbound`: events from users
//! - `bots.<bot_id>.outbound`: actions for users

use crate::envelope::Envelope;
use crate::store::{StateStore, StoreError};
use crate::transport::{InboundStream, Transport, TransportError};
use async_nats::jetstream;
use async_nats::jetstream::kv;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use botwright_core::{BotId, ChatUserId};
use botwright_flow::{ConversationState, InboundEvent, OutboundAction, TransportCredential};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default subject prefix.
const SUBJECT_PREFIX: &str = "bots";

/// Default key-value bucket for conversation state.
const STATE_BUCKET: &str = "conversation-state";

/// Default bound on the attach handshake.
const ATTACH_TIMEOUT_MS: u64 = 5000;

/// Connection settings shared by the NATS collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL.
    #[serde(default = "default_url")]
    pub url: String,
    /// Subject prefix (defaults to `bots`).
    #[serde(default)]
    pub subject_prefix: Option<String>,
    /// Key-value bucket for conversation state (defaults to
    /// `conversation-state`).
    #[serde(default)]
    pub state_bucket: Option<String>,
    /// Attach handshake timeout in milliseconds.
    #[serde(default)]
    pub attach_timeout_ms: Option<u64>,
}

fn default_url() -> String {
    "nats://localhost:4222".to_string()
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self::new(default_url())
    }
}

impl NatsConfig {
    /// Creates a config with the given URL and default names.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            subject_prefix: None,
            state_bucket: None,
            attach_timeout_ms: None,
        }
    }

    fn prefix(&self) -> &str {
        self.subject_prefix.as_deref().unwrap_or(SUBJECT_PREFIX)
    }

    fn bucket(&self) -> &str {
        self.state_bucket.as_deref().unwrap_or(STATE_BUCKET)
    }

    fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms.unwrap_or(ATTACH_TIMEOUT_MS))
    }

    fn attach_subject(&self) -> String {
        format!("{}.control.attach", self.prefix())
    }

    fn detach_subject(&self) -> String {
        format!("{}.control.detach", self.prefix())
    }

    fn inbound_subject(&self, bot_id: &BotId) -> String {
        format!("{}.{bot_id}.inbound", self.prefix())
    }

    fn outbound_subject(&self, bot_id: &BotId) -> String {
        format!("{}.{bot_id}.outbound", self.prefix())
    }

    /// Connects to the server.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if the server cannot be
    /// reached.
    pub async fn connect(&self) -> Result<async_nats::Client, TransportError> {
        async_nats::connect(&self.url)
            .await
            .map_err(|e| TransportError::ConnectionFailed {
                message: e.to_string(),
            })
    }
}

/// Key for one user's state. User ids are free-form, so they are encoded to
/// stay within the key alphabet; the bot id prefix allows per-bot scans.
fn state_key(bot_id: &BotId, user_id: &ChatUserId) -> String {
    format!("{bot_id}.{}", URL_SAFE_NO_PAD.encode(user_id.as_str()))
}

/// Conversation state in a JetStream key-value bucket.
pub struct NatsStateStore {
    store: kv::Store,
}

impl NatsStateStore {
    /// Opens the state bucket, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the bucket cannot be opened
    /// or created.
    pub async fn new(client: async_nats::Client, config: &NatsConfig) -> Result<Self, StoreError> {
        let jetstream = jetstream::new(client);
        let store = match jetstream.get_key_value(config.bucket()).await {
            Ok(store) => store,
            Err(_) => jetstream
                .create_key_value(kv::Config {
                    bucket: config.bucket().to_string(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|e| StoreError::Unavailable {
                    message: format!("failed to create state bucket: {e}"),
                })?,
        };
        Ok(Self { store })
    }
}

#[async_trait]
impl StateStore for NatsStateStore {
    async fn load_state(
        &self,
        bot_id: &BotId,
        user_id: &ChatUserId,
    ) -> Result<ConversationState, StoreError> {
        let key = state_key(bot_id, user_id);
        let entry = self
            .store
            .get(key.as_str())
            .await
            .map_err(|e| StoreError::Unavailable {
                message: e.to_string(),
            })?;

        match entry {
            None => Ok(ConversationState::new(bot_id.clone(), user_id.clone())),
            Some(bytes) => Envelope::<ConversationState>::decode(&bytes)
                .map(Envelope::into_payload)
                .map_err(|message| StoreError::Corrupt { key, message }),
        }
    }

    async fn save_state(&self, state: &ConversationState) -> Result<(), StoreError> {
        let key = state_key(&state.bot_id, &state.user_id);
        let bytes = Envelope::new(state)
            .to_json_bytes()
            .map_err(|e| StoreError::Corrupt {
                key: key.clone(),
                message: e.to_string(),
            })?;

        self.store
            .put(key.as_str(), bytes.into())
            .await
            .map_err(|e| StoreError::Unavailable {
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn clear_bot(&self, bot_id: &BotId) -> Result<u64, StoreError> {
        let prefix = format!("{bot_id}.");
        let mut keys = Box::pin(self.store.keys().await.map_err(|e| {
            StoreError::Unavailable {
                message: format!("failed to list keys: {e}"),
            }
        })?);

        let mut matching = Vec::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| StoreError::Unavailable {
                message: format!("failed to list keys: {e}"),
            })?;
            if key.starts_with(&prefix) {
                matching.push(key);
            }
        }

        let mut removed = 0;
        for key in matching {
            self.store
                .purge(key.as_str())
                .await
                .map_err(|e| StoreError::Unavailable {
                    message: e.to_string(),
                })?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// Sent on the attach subject.
#[derive(Debug, Serialize, Deserialize)]
struct AttachRequest {
    bot_id: BotId,
    credential: TransportCredential,
}

/// The gateway's answer to an attach request.
#[derive(Debug, Serialize, Deserialize)]
struct AttachReply {
    accepted: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Sent on the detach subject.
#[derive(Debug, Serialize, Deserialize)]
struct DetachNotice {
    bot_id: BotId,
}

/// Published on a bot's outbound subject.
#[derive(Debug, Serialize, Deserialize)]
struct OutboundMessage {
    user_id: ChatUserId,
    action: OutboundAction,
}

/// Transport over NATS subjects.
#[derive(Clone)]
pub struct NatsTransport {
    client: async_nats::Client,
    config: NatsConfig,
}

impl NatsTransport {
    #[must_use]
    pub fn new(client: async_nats::Client, config: NatsConfig) -> Self {
        Self { client, config }
    }

    async fn attach(
        &self,
        bot_id: &BotId,
        credential: &TransportCredential,
    ) -> Result<(), TransportError> {
        let request = Envelope::new(AttachRequest {
            bot_id: bot_id.clone(),
            credential: credential.clone(),
        })
        .to_json_bytes()
        .map_err(|e| TransportError::SubscribeFailed {
            message: format!("failed to serialize attach request: {e}"),
        })?;

        let response = tokio::time::timeout(
            self.config.attach_timeout(),
            self.client
                .request(self.config.attach_subject(), request.into()),
        )
        .await
        .map_err(|_| TransportError::SubscribeFailed {
            message: "attach request timed out".to_string(),
        })?
        .map_err(|e| TransportError::SubscribeFailed {
            message: e.to_string(),
        })?;

        let reply = Envelope::<AttachReply>::decode(&response.payload)
            .map_err(|message| TransportError::SubscribeFailed { message })?
            .into_payload();
        if !reply.accepted {
            return Err(TransportError::SubscribeFailed {
                message: reply
                    .reason
                    .unwrap_or_else(|| "attach refused by gateway".to_string()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn subscribe(
        &self,
        bot_id: &BotId,
        credential: &TransportCredential,
    ) -> Result<InboundStream, TransportError> {
        // Subscribe before attaching so no event published right after the
        // gateway accepts is missed.
        let subscriber = self
            .client
            .subscribe(self.config.inbound_subject(bot_id))
            .await
            .map_err(|e| TransportError::SubscribeFailed {
                message: e.to_string(),
            })?;

        self.attach(bot_id, credential).await?;

        let detach = DetachOnDrop {
            client: self.client.clone(),
            subject: self.config.detach_subject(),
            bot_id: bot_id.clone(),
        };
        let source = bot_id.clone();
        let events = subscriber.filter_map(move |message| {
            let _held = &detach;
            let decoded = match Envelope::<InboundEvent>::decode(&message.payload) {
                Ok(envelope) => Some(envelope.into_payload()),
                Err(error) => {
                    tracing::warn!(bot_id = %source, %error, "dropping undecodable inbound message");
                    None
                }
            };
            futures::future::ready(decoded)
        });
        Ok(Box::pin(events))
    }

    async fn send(
        &self,
        bot_id: &BotId,
        user_id: &ChatUserId,
        action: &OutboundAction,
    ) -> Result<(), TransportError> {
        let bytes = Envelope::new(OutboundMessage {
            user_id: user_id.clone(),
            action: action.clone(),
        })
        .to_json_bytes()
        .map_err(|e| TransportError::SendFailed {
            message: format!("failed to serialize action: {e}"),
        })?;

        self.client
            .publish(self.config.outbound_subject(bot_id), bytes.into())
            .await
            .map_err(|e| TransportError::SendFailed {
                message: e.to_string(),
            })
    }
}

/// Tells the gateway a bot is gone when its inbound stream is dropped.
struct DetachOnDrop {
    client: async_nats::Client,
    subject: String,
    bot_id: BotId,
}

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let notice = match Envelope::new(DetachNotice {
            bot_id: self.bot_id.clone(),
        })
        .to_json_bytes()
        {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        let client = self.client.clone();
        let subject = std::mem::take(&mut self.subject);
        let bot_id = self.bot_id.clone();
        handle.spawn(async move {
            if let Err(error) = client.publish(subject, notice.into()).await {
                tracing::warn!(%bot_id, %error, "failed to publish detach notice");
            }
        });
    }
}
