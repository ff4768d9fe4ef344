//! Chat message type and its wire codec.
//!
//! Every payload on the topic is one JSON object:
//!
//! ```json
//! {"sender":"Ghost-42","content":"hi","timestamp":1718000000}
//! ```
//!
//! `timestamp` is Unix seconds from the sender's clock. There is no version
//! field, id or signature.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from encoding a message
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A single chat line. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    sender: String,
    content: String,
    timestamp: i64,
}

impl ChatMessage {
    /// Creates a message stamped with the current wall-clock time.
    pub fn new(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_timestamp(sender, content, unix_now())
    }

    /// Creates a message with an explicit Unix timestamp.
    pub fn with_timestamp(
        sender: impl Into<String>,
        content: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            sender: sender.into(),
            content: content.into(),
            timestamp,
        }
    }

    #[inline]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    #[inline]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Unix seconds, as set by the sender.
    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Returns the timestamp as a `SystemTime`.
    ///
    /// Timestamps outside the platform's representable range read as the epoch.
    pub fn time(&self) -> SystemTime {
        let offset = Duration::from_secs(self.timestamp.unsigned_abs());
        let time = if self.timestamp >= 0 {
            UNIX_EPOCH.checked_add(offset)
        } else {
            UNIX_EPOCH.checked_sub(offset)
        };
        time.unwrap_or(UNIX_EPOCH)
    }

    /// Serializes the message to its wire form.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a wire payload. Returns `None` for anything malformed.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Current Unix time in seconds. Clocks before the epoch read as 0.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
