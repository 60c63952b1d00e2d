//! Message transport contract.
//!
//! The transport connects a bot to the messaging platform. Subscribing
//! yields the bot's inbound events; dropping the stream ends the
//! subscription. A stream that ends on its own means the connection was
//! lost and no further events can arrive.

use async_trait::async_trait;
use botwright_core::{BotId, ChatUserId};
use botwright_flow::{InboundEvent, OutboundAction, TransportCredential};
use futures::stream::BoxStream;

/// Inbound events for one bot, in arrival order.
pub type InboundStream = BoxStream<'static, InboundEvent>;

/// Trait for the external messaging transport.
///
/// This abstraction lets the runtime be tested without a live platform
/// connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connects a bot and returns its inbound event stream.
    async fn subscribe(
        &self,
        bot_id: &BotId,
        credential: &TransportCredential,
    ) -> Result<InboundStream, TransportError>;

    /// Delivers one action to one user.
    async fn send(
        &self,
        bot_id: &BotId,
        user_id: &ChatUserId,
        action: &OutboundAction,
    ) -> Result<(), TransportError>;
}

/// Errors from transport operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not reach the transport.
    ConnectionFailed { message: String },
    /// The transport refused the subscription.
    SubscribeFailed { message: String },
    /// Delivery of an outbound action failed.
    SendFailed { message: String },
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed { message } => {
                write!(f, "transport connection failed: {message}")
            }
            Self::SubscribeFailed { message } => write!(f, "subscribe failed: {message}"),
            Self::SendFailed { message } => write!(f, "send failed: {message}"),
        }
    }
}

impl std::error::Error for TransportError {}
