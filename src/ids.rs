//! Opaque identifiers used throughout the engine.

use std::fmt;
use ulid::Ulid;

/// A 128-bit message identifier, unique per inbox. Sortable by generation
/// time, which keeps `(received_at, id)` tie-breaks stable even when two
/// messages share a millisecond timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct MessageId(Ulid);

impl MessageId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MessageId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

/// Opaque identifier for one worker instance, stable across restarts within a
/// process. Never interpreted by the backend beyond equality comparisons for
/// lease ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessorId(String);

impl ProcessorId {
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProcessorId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for ProcessorId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
