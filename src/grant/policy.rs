use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::GrantError;
use crate::time::to_chrono;

use super::{Expiration, GrantDuration};

/// Turns a requested duration into an expiration.
pub trait GrantPolicy: Send + Sync + fmt::Debug {
    /// Compute the expiration for a grant requested (or renewed) at `now`.
    ///
    /// # Errors
    /// `InvalidDuration` for zero durations, `GrantDenied` if the policy
    /// refuses the request.
    fn expiration(&self, now: DateTime<Utc>, requested: GrantDuration) -> Result<Expiration, GrantError>;
}

/// Caps every grant at a configured maximum.
///
/// Unbounded requests are granted the maximum unless `allow_unbounded` is set.
#[derive(Debug, Clone, Copy)]
pub struct FixedCeilingPolicy {
    /// Longest grant the policy hands out.
    pub max: Duration,
    /// Whether `Unbounded` requests get a grant that never expires.
    pub allow_unbounded: bool,
}

impl FixedCeilingPolicy {
    /// Cap finite grants at `max`; unbounded requests get `max` too.
    #[must_use]
    pub const fn new(max: Duration) -> Self {
        Self {
            max,
            allow_unbounded: false,
        }
    }

    /// Same ceiling for finite requests, but honor `Unbounded`.
    #[must_use]
    pub const fn allowing_unbounded(mut self) -> Self {
        self.allow_unbounded = true;
        self
    }
}

impl Default for FixedCeilingPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5 * 60))
    }
}

impl GrantPolicy for FixedCeilingPolicy {
    fn expiration(&self, now: DateTime<Utc>, requested: GrantDuration) -> Result<Expiration, GrantError> {
        let granted = match requested {
            GrantDuration::Finite(d) if d.is_zero() => {
                return Err(GrantError::InvalidDuration {
                    reason: "duration must be at least 1ms or unbounded".to_string(),
                });
            }
            GrantDuration::Finite(d) => d.min(self.max),
            GrantDuration::Unbounded if self.allow_unbounded => return Ok(Expiration::Never),
            GrantDuration::Unbounded => self.max,
        };

        if granted.is_zero() {
            return Err(GrantError::GrantDenied {
                reason: "policy ceiling is zero".to_string(),
            });
        }

        Ok(now
            .checked_add_signed(to_chrono(granted))
            .map_or(Expiration::Never, Expiration::At))
    }
}
