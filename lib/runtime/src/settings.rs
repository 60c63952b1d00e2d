//! Runtime tuning.

use botwright_flow::{DEFAULT_MAX_STEPS_PER_EVENT, EngineLimits};
use serde::Deserialize;
use std::time::Duration;

/// Tunables for the supervisor and its instances.
///
/// Every field has a default so the whole section may be omitted from
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuntimeSettings {
    /// Bound on steps visited while handling one event.
    #[serde(default = "default_max_steps_per_event")]
    pub max_steps_per_event: usize,
    /// Bound on each state load or save.
    #[serde(default = "default_persistence_timeout_ms")]
    pub persistence_timeout_ms: u64,
    /// Delivery attempts per outbound action, including the first.
    #[serde(default = "default_send_attempts")]
    pub send_attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    #[serde(default = "default_send_backoff_ms")]
    pub send_backoff_ms: u64,
    /// How long an idle user lane is kept before its task exits.
    #[serde(default = "default_lane_idle_secs")]
    pub lane_idle_secs: u64,
    /// Delete a bot's conversation states when it is undeployed.
    #[serde(default)]
    pub purge_state_on_undeploy: bool,
    /// Redeploy once when an instance loses its transport connection.
    #[serde(default = "default_redeploy_on_failure")]
    pub redeploy_on_failure: bool,
    /// Sent when an event could not be applied and may be retried.
    #[serde(default = "default_retry_message")]
    pub retry_message: String,
    /// Sent when a flow ran away and the conversation was reset.
    #[serde(default = "default_loop_message")]
    pub loop_message: String,
}

fn default_max_steps_per_event() -> usize {
    DEFAULT_MAX_STEPS_PER_EVENT
}

fn default_persistence_timeout_ms() -> u64 {
    2000
}

fn default_send_attempts() -> u32 {
    3
}

fn default_send_backoff_ms() -> u64 {
    200
}

fn default_lane_idle_secs() -> u64 {
    60
}

fn default_redeploy_on_failure() -> bool {
    true
}

fn default_retry_message() -> String {
    "Something went wrong, please try again.".to_string()
}

fn default_loop_message() -> String {
    "This conversation could not continue and has been reset.".to_string()
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_steps_per_event: default_max_steps_per_event(),
            persistence_timeout_ms: default_persistence_timeout_ms(),
            send_attempts: default_send_attempts(),
            send_backoff_ms: default_send_backoff_ms(),
            lane_idle_secs: default_lane_idle_secs(),
            purge_state_on_undeploy: false,
            redeploy_on_failure: default_redeploy_on_failure(),
            retry_message: default_retry_message(),
            loop_message: default_loop_message(),
        }
    }
}

impl RuntimeSettings {
    #[must_use]
    pub fn engine_limits(&self) -> EngineLimits {
        EngineLimits {
            max_steps_per_event: self.max_steps_per_event,
        }
    }

    #[must_use]
    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_millis(self.persistence_timeout_ms)
    }

    /// Backoff before retry number `retry` (1-based).
    #[must_use]
    pub fn send_backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.send_backoff_ms.saturating_mul(factor))
    }

    #[must_use]
    pub fn lane_idle(&self) -> Duration {
        Duration::from_secs(self.lane_idle_secs)
    }

    /// Reply for a command that is neither in the table nor a flow trigger.
    #[must_use]
    pub fn unknown_command(name: &str) -> String {
        format!("Command /{name} not found")
    }
}
