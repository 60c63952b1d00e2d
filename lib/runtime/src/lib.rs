//! Bot runtime for botwright.
//!
//! This crate runs deployed bots:
//!
//! - **Collaborators**: traits for the definition source, the conversation
//!   state store and the message transport, with in-memory and NATS
//!   implementations
//! - **Lanes**: one serialization domain per (bot, user) so a user's events
//!   apply one at a time, in arrival order
//! - **Instances**: one running bot with its own inbound worker
//! - **Registry**: the single map of live instances
//! - **Supervisor**: deploy, undeploy, recovery, routing and simulation

pub mod envelope;
pub mod error;
pub mod instance;
pub mod lanes;
pub mod memory;
pub mod nats;
pub mod registry;
pub mod settings;
pub mod source;
pub mod store;
pub mod supervisor;
pub mod transport;

pub use error::RuntimeError;
pub use instance::{InstanceStatus, InstanceSummary};
pub use memory::{InMemoryDefinitionSource, InMemoryStateStore, InMemoryTransport};
pub use nats::{NatsConfig, NatsStateStore, NatsTransport};
pub use registry::Registry;
pub use settings::RuntimeSettings;
pub use source::{DefinitionSource, SourceError};
pub use store::{StateStore, StoreError};
pub use supervisor::{RecoveryReport, Supervisor};
pub use transport::{InboundStream, Transport, TransportError};
