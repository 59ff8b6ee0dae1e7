//! Error types for herald.
//!
//! All errors are strongly typed using thiserror. Delivery and connection
//! failures are classified locally (see [`FailureClass`]) so callers outside a
//! component only ever see the taxonomy below, never raw transport errors.

use thiserror::Error;

use crate::grant::GrantToken;

/// Grant bookkeeping errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GrantError {
    #[error("Unknown grant: {token}")]
    UnknownGrant {
        token: GrantToken,
    },

    #[error("Grant denied: {reason}")]
    GrantDenied {
        reason: String,
    },

    #[error("Invalid grant duration: {reason}")]
    InvalidDuration {
        reason: String,
    },
}

/// Failures raised by a delivery target or by the transport in front of it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The target cannot interpret this event's concrete type.
    #[error("Unrecognized event type '{kind}'")]
    UnrecognizedEvent {
        kind: String,
    },

    /// Transient communication failure (connection reset, timeout).
    #[error("Retryable transport failure: {message}")]
    RetryableTransport {
        message: String,
    },

    /// Permanent communication failure (target gone, protocol mismatch).
    #[error("Unrecoverable transport failure: {message}")]
    UnrecoverableTransport {
        message: String,
    },
}

impl DeliveryError {
    /// Shorthand for a retryable transport failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::RetryableTransport {
            message: message.into(),
        }
    }

    /// Shorthand for an unrecoverable transport failure.
    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::UnrecoverableTransport {
            message: message.into(),
        }
    }

    /// Shorthand for an unrecognized event failure.
    pub fn unrecognized(kind: impl Into<String>) -> Self {
        Self::UnrecognizedEvent { kind: kind.into() }
    }

    /// Classify this failure.
    #[must_use]
    pub const fn class(&self) -> FailureClass {
        match self {
            Self::UnrecognizedEvent { .. } => FailureClass::Unrecognized,
            Self::RetryableTransport { .. } => FailureClass::Retryable,
            Self::UnrecoverableTransport { .. } => FailureClass::Unrecoverable,
        }
    }
}

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Codec error: {message}")]
    Codec {
        message: String,
    },

    #[error("Data directory {path} is locked by another process")]
    Locked {
        path: String,
    },
}

/// How a caller should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Permanent per-listener condition: unregister or suppress, never retry.
    Unrecognized,
    /// Transient: leave the grant alone, retry later.
    Retryable,
    /// Permanent: abandon the listener or connection.
    Unrecoverable,
}

impl FailureClass {
    /// True for the two classes that end a listener or connection.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Retryable)
    }
}

/// Top-level error type for herald.
#[derive(Debug, Error)]
pub enum HeraldError {
    #[error("Grant error: {0}")]
    Grant(#[from] GrantError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Unknown registration: {token}")]
    UnknownRegistration {
        token: GrantToken,
    },

    #[error("No consumer available for event type {type_code}")]
    NoConsumer {
        type_code: u64,
    },

    /// The peer answered, but with something the contract forbids.
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
    },

    #[error("Queue full on {path} (capacity {capacity})")]
    QueueFull {
        path: String,
        capacity: usize,
    },

    #[error("Worker channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl HeraldError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a disconnected error for the named worker path.
    #[must_use]
    pub fn disconnected(path: impl Into<String>) -> Self {
        Self::Disconnected { path: path.into() }
    }

    /// Shorthand for `GrantError::UnknownGrant`.
    #[must_use]
    pub fn unknown_grant(token: GrantToken) -> Self {
        Self::Grant(GrantError::UnknownGrant { token })
    }

    /// Classify this error from the point of view of a connection or listener.
    ///
    /// Unknown grants are retryable: the grant has lapsed server-side and a
    /// fresh registration is the way forward. Policy refusals and bad
    /// durations will not change on retry.
    #[must_use]
    pub const fn class(&self) -> FailureClass {
        match self {
            Self::Delivery(e) => e.class(),
            Self::Grant(GrantError::UnknownGrant { .. }) => FailureClass::Retryable,
            Self::Grant(_) => FailureClass::Unrecoverable,
            Self::UnknownRegistration { .. } => FailureClass::Retryable,
            Self::NoConsumer { .. }
            | Self::QueueFull { .. }
            | Self::Disconnected { .. }
            | Self::Protocol { .. } => {
                FailureClass::Retryable
            }
            Self::Storage(StorageError::Io { .. }) => FailureClass::Retryable,
            Self::Storage(_) | Self::InvalidConfig { .. } | Self::Internal { .. } => {
                FailureClass::Unrecoverable
            }
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.class(), FailureClass::Retryable)
    }

    /// Returns true if the caller should give up.
    #[must_use]
    pub const fn is_unrecoverable(&self) -> bool {
        self.class().is_terminal()
    }

    /// Returns true if a target refused the event's concrete type.
    #[must_use]
    pub const fn is_unrecognized(&self) -> bool {
        matches!(self.class(), FailureClass::Unrecognized)
    }
}

/// Result type alias for herald operations.
pub type HeraldResult<T> = Result<T, HeraldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_error_classes() {
        assert_eq!(DeliveryError::unrecognized("x").class(), FailureClass::Unrecognized);
        assert_eq!(DeliveryError::retryable("reset").class(), FailureClass::Retryable);
        assert_eq!(DeliveryError::unrecoverable("gone").class(), FailureClass::Unrecoverable);
    }

    #[test]
    fn test_unrecognized_is_terminal() {
        assert!(FailureClass::Unrecognized.is_terminal());
        assert!(FailureClass::Unrecoverable.is_terminal());
        assert!(!FailureClass::Retryable.is_terminal());
    }

    #[test]
    fn test_unknown_grant_is_retryable_for_connections() {
        let err = HeraldError::unknown_grant(GrantToken::new());
        assert!(err.is_retryable());
        assert!(!err.is_unrecoverable());
    }

    #[test]
    fn test_grant_denied_is_unrecoverable() {
        let err: HeraldError = GrantError::GrantDenied {
            reason: "policy".to_string(),
        }
        .into();
        assert!(err.is_unrecoverable());
        assert!(format!("{err}").contains("policy"));
    }

    #[test]
    fn test_transport_error_from_delivery() {
        let err: HeraldError = DeliveryError::retryable("timeout").into();
        assert!(err.is_retryable());
        let msg = format!("{err}");
        assert!(msg.contains("timeout"));
    }

    #[test]
    fn test_unrecognized_delivery_error() {
        let err: HeraldError = DeliveryError::unrecognized("svc.alarm").into();
        assert!(err.is_unrecognized());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_internal_error() {
        let err = HeraldError::internal("unexpected state");
        assert!(err.is_unrecoverable());
        assert!(format!("{err}").contains("unexpected state"));
    }
}
