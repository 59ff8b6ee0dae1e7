//! Time-bounded grants.
//!
//! A grant authorizes a resource (a listener slot on a producer, a
//! registration on the collector) to stay active until its expiration. Grants
//! are never evicted by timers: a grant past its expiration is logically
//! absent, and callers (dispatch, reaper) check validity lazily.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pluggable duration policies.
pub mod policy;
/// Token-keyed grant store.
pub mod registry;

pub use policy::{FixedCeilingPolicy, GrantPolicy};
pub use registry::{GrantRegistry, RemovalHook, RemovalReason};

/// Opaque grant token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantToken(Uuid);

impl GrantToken {
    /// Create a new random token.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for GrantToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GrantToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Requested or granted length of a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum GrantDuration {
    /// A bounded duration.
    Finite(Duration),
    /// No expiry requested.
    Unbounded,
}

impl GrantDuration {
    /// Bounded duration of `secs` seconds.
    #[must_use]
    pub const fn secs(secs: u64) -> Self {
        Self::Finite(Duration::from_secs(secs))
    }

    /// Bounded duration of `millis` milliseconds.
    #[must_use]
    pub const fn millis(millis: u64) -> Self {
        Self::Finite(Duration::from_millis(millis))
    }

    /// True for a finite zero duration.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        matches!(self, Self::Finite(d) if d.is_zero())
    }
}

/// When a grant lapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "at", rename_all = "snake_case")]
pub enum Expiration {
    /// At a fixed instant.
    At(DateTime<Utc>),
    /// Never.
    Never,
}

impl Expiration {
    /// True while `now` is strictly before the expiration.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::At(at) => *at > now,
            Self::Never => true,
        }
    }

    /// Remaining duration as seen at `now`.
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> GrantDuration {
        match self {
            Self::At(at) => GrantDuration::Finite(crate::time::remaining(now, *at)),
            Self::Never => GrantDuration::Unbounded,
        }
    }
}

/// An issued grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Token identifying the granted resource.
    pub token: GrantToken,
    /// When the grant lapses unless renewed.
    pub expiration: Expiration,
}

impl Grant {
    /// Duration granted, measured from `now`.
    #[must_use]
    pub fn duration(&self, now: DateTime<Utc>) -> GrantDuration {
        self.expiration.remaining(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiration_ordering() {
        let now = Utc::now();
        assert!(Expiration::At(now) < Expiration::Never);
        assert!(Expiration::At(now) < Expiration::At(now + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_expiration_liveness_is_strict() {
        let now = Utc::now();
        assert!(!Expiration::At(now).is_live(now));
        assert!(Expiration::At(now + chrono::Duration::milliseconds(1)).is_live(now));
        assert!(Expiration::Never.is_live(now));
    }

    #[test]
    fn test_zero_duration() {
        assert!(GrantDuration::millis(0).is_zero());
        assert!(!GrantDuration::Unbounded.is_zero());
    }
}
