//! Centralized server configuration.
//!
//! Loaded via the `config` crate from environment variables, with `__`
//! separating nested sections:
//!
//! ```text
//! LISTEN_ADDR=0.0.0.0:3003
//! DEFINITION_SOURCE_URL=http://localhost:3004
//! NATS__URL=nats://localhost:4222
//! RUNTIME__PERSISTENCE_TIMEOUT_MS=2000
//! ```

use botwright_runtime::{NatsConfig, RuntimeSettings};
use serde::Deserialize;

/// Server configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address the management API binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Base URL of the service that owns bot definitions.
    #[serde(default = "default_definition_source_url")]
    pub definition_source_url: String,

    /// NATS connection for state and transport.
    #[serde(default)]
    pub nats: NatsConfig,

    /// Runtime tuning.
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3003".to_string()
}

fn default_definition_source_url() -> String {
    "http://localhost:3004".to_string()
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_source(
            config::Environment::default()
                .separator("__")
                .try_parsing(true),
        )
    }

    fn from_source<S>(source: S) -> Result<Self, config::ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()
    }
}
