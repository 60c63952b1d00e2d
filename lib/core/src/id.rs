//! Strongly-typed identifiers.
//!
//! Bot and chat-user identifiers are assigned by external systems (the
//! authoring store and the messaging platform), so they are validated
//! string keys. Instance identifiers are minted by the runtime and use ULID,
//! which keeps them unique and sortable by creation time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Error returned when parsing an identifier from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of identifier that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Generates a string-keyed identifier whose contents are checked by `$check`.
macro_rules! define_key {
    ($(#[$meta:meta])* $name:ident, $check:path) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $check(s).map_err(|reason| ParseIdError {
                    id_type: stringify!($name),
                    reason,
                })?;
                Ok(Self(s.to_string()))
            }
        }

        impl TryFrom<String> for $name {
            type Error = ParseIdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                $check(&value).map_err(|reason| ParseIdError {
                    id_type: stringify!($name),
                    reason,
                })?;
                Ok(Self(value))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

const MAX_BOT_ID_LEN: usize = 64;
const MAX_CHAT_USER_ID_LEN: usize = 256;

/// Bot ids end up in message subjects and storage keys, so only
/// `[A-Za-z0-9_-]` is accepted.
fn check_bot_id(s: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err("empty".to_string());
    }
    if s.len() > MAX_BOT_ID_LEN {
        return Err(format!("longer than {MAX_BOT_ID_LEN} characters"));
    }
    match s
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        Some(c) => Err(format!("invalid character '{c}'")),
        None => Ok(()),
    }
}

fn check_chat_user_id(s: &str) -> Result<(), String> {
    if s.trim().is_empty() {
        return Err("empty".to_string());
    }
    if s.len() > MAX_CHAT_USER_ID_LEN {
        return Err(format!("longer than {MAX_CHAT_USER_ID_LEN} bytes"));
    }
    if s.chars().any(char::is_control) {
        return Err("contains control characters".to_string());
    }
    Ok(())
}

define_key!(
    /// Identifier of a bot definition, assigned by the authoring store.
    BotId,
    check_bot_id
);

define_key!(
    /// Identifier of an end user on the messaging platform.
    ChatUserId,
    check_chat_user_id
);

/// Identifier of one started bot instance.
///
/// Every deploy (including a redeploy of the same bot) mints a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Ulid);

impl InstanceId {
    /// Creates a new instance id with a randomly generated ULID.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inst_{}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("inst_").unwrap_or(s);
        Ulid::from_str(raw).map(Self).map_err(|e| ParseIdError {
            id_type: "InstanceId",
            reason: e.to_string(),
        })
    }
}
