//! Versioned envelope for data written to NATS.
//!
//! Conversation state in the key-value bucket and messages on the
//! transport subjects are all wrapped so their shape can evolve without
//! breaking readers that are still running the previous release.

use serde::{Deserialize, Serialize};

/// The envelope version this build writes.
pub const CURRENT_VERSION: u32 = 1;

/// A payload tagged with its format version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Format version.
    pub version: u32,
    /// The wrapped payload.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Wraps a payload at the current version.
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            payload,
        }
    }

    /// Unwraps the payload.
    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serializes to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<T: for<'de> Deserialize<'de>> Envelope<T> {
    /// Decodes JSON bytes, rejecting versions newer than this build
    /// understands.
    ///
    /// # Errors
    ///
    /// Returns a message describing the malformed or unsupported input.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let envelope: Self = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        if envelope.version > CURRENT_VERSION {
            return Err(format!(
                "unsupported envelope version {} (newest known is {CURRENT_VERSION})",
                envelope.version
            ));
        }
        Ok(envelope)
    }
}
