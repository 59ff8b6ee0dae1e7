//! Event data model.
//!
//! An [`Event`] carries a type code, a sequence number scoped to that type, an
//! origin timestamp and an opaque JSON payload. Storage orders events by
//! [`EventKey`] `(timestamp, type_code, sequence)`; logical identity (used for
//! deletion and consumer-side de-duplication) is [`EventId`] `(type_code,
//! sequence)`.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Advertised event type: a human-readable identifier plus a numeric code.
///
/// Two descriptors match when their type codes are equal; the identifier is
/// informational.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventDescriptor {
    /// Event type identifier, e.g. `"service.failure"`.
    pub kind: String,
    /// Numeric type code.
    pub type_code: u64,
}

impl EventDescriptor {
    /// Create a descriptor.
    pub fn new(kind: impl Into<String>, type_code: u64) -> Self {
        Self {
            kind: kind.into(),
            type_code,
        }
    }

    /// True if `other` describes the same type code.
    #[must_use]
    pub const fn matches(&self, other: &Self) -> bool {
        self.type_code == other.type_code
    }
}

impl fmt::Display for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.type_code)
    }
}

/// Opaque token a subscriber hands to a producer and gets echoed back on each
/// event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handback(pub String);

impl Handback {
    /// Wrap a string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

/// Logical identity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    #[allow(missing_docs)]
    pub type_code: u64,
    #[allow(missing_docs)]
    pub sequence: u64,
}

impl EventId {
    #[allow(missing_docs)]
    #[must_use]
    pub const fn new(type_code: u64, sequence: u64) -> Self {
        Self { type_code, sequence }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_code, self.sequence)
    }
}

/// Storage ordering key: timestamp first, then type, then sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    #[allow(missing_docs)]
    pub timestamp: DateTime<Utc>,
    #[allow(missing_docs)]
    pub type_code: u64,
    #[allow(missing_docs)]
    pub sequence: u64,
}

impl EventKey {
    /// Logical identity of the keyed event.
    #[must_use]
    pub const fn id(&self) -> EventId {
        EventId::new(self.type_code, self.sequence)
    }
}

impl Ord for EventKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.type_code.cmp(&other.type_code))
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for EventKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            self.id(),
            self.timestamp.timestamp_millis()
        )
    }
}

/// Position in the ordered event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventCursor {
    /// Before the first event. Also the cursor of a registration that has
    /// never been attached.
    #[default]
    Unset,
    /// Strictly after the given key.
    After(EventKey),
}

impl EventCursor {
    /// True if an event with `key` lies beyond this cursor.
    #[must_use]
    pub fn admits(&self, key: &EventKey) -> bool {
        match self {
            Self::Unset => true,
            Self::After(k) => key > k,
        }
    }
}

/// A single event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Numeric type code.
    pub type_code: u64,
    /// Type identifier, used to track types a target has rejected.
    pub kind: String,
    /// Sequence number, monotonically increasing within the type.
    pub sequence: u64,
    /// Origin timestamp.
    pub timestamp: DateTime<Utc>,
    /// Opaque payload.
    pub payload: serde_json::Value,
    /// Echo token supplied at subscribe time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handback: Option<Handback>,
}

impl Event {
    /// Create an event of the given descriptor's type.
    #[must_use]
    pub fn new(
        descriptor: &EventDescriptor,
        sequence: u64,
        timestamp: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            type_code: descriptor.type_code,
            kind: descriptor.kind.clone(),
            sequence,
            timestamp,
            payload,
            handback: None,
        }
    }

    /// Same event carrying the given handback.
    #[must_use]
    pub fn with_handback(mut self, handback: Option<Handback>) -> Self {
        self.handback = handback;
        self
    }

    /// Storage ordering key.
    #[must_use]
    pub const fn key(&self) -> EventKey {
        EventKey {
            timestamp: self.timestamp,
            type_code: self.type_code,
            sequence: self.sequence,
        }
    }

    /// Logical identity.
    #[must_use]
    pub const fn id(&self) -> EventId {
        EventId::new(self.type_code, self.sequence)
    }

    /// Descriptor of this event's type.
    #[must_use]
    pub fn descriptor(&self) -> EventDescriptor {
        EventDescriptor::new(self.kind.clone(), self.type_code)
    }
}
