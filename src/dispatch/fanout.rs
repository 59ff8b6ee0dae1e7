//! Fan-out dispatch of events to granted listeners.
//!
//! The dispatcher holds no per-event state: each `fire` works over the current
//! snapshot of listener resources, validates each grant lazily and evicts
//! listeners whose grant has lapsed or whose delivery failed permanently.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{FailureClass, GrantError, HeraldError, HeraldResult};
use crate::event::{Event, EventDescriptor, Handback};
use crate::grant::{Grant, GrantDuration, GrantPolicy, GrantRegistry, GrantToken, RemovalReason};
use crate::time::SharedClock;

use super::target::SharedTarget;

/// How a fired event is spread over listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchMode {
    /// Every valid listener receives every event.
    Broadcast,
    /// Exactly one listener receives each event, rotating through the set.
    Rotating,
}

/// A listener resource: where to deliver and what to echo back.
#[derive(Clone)]
pub struct Listener {
    /// Delivery target.
    pub target: SharedTarget,
    /// Echo token supplied at subscribe time.
    pub handback: Option<Handback>,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("handback", &self.handback)
            .finish_non_exhaustive()
    }
}

/// Outcome of one `fire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FireReport {
    /// Sequence number carried by the fired event.
    pub sequence: u64,
    /// Listeners that accepted the event.
    pub delivered: usize,
    /// Listeners evicted while firing.
    pub evicted: usize,
}

/// Delivers events of one descriptor to its granted listeners.
pub struct FanoutDispatcher {
    descriptor: EventDescriptor,
    mode: DispatchMode,
    listeners: GrantRegistry<Listener>,
    sequence: AtomicU64,
    cursor: AtomicUsize,
}

impl fmt::Debug for FanoutDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutDispatcher")
            .field("descriptor", &self.descriptor)
            .field("mode", &self.mode)
            .field("listeners", &self.listeners.len())
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl FanoutDispatcher {
    /// Create a dispatcher with its own listener registry.
    pub fn new(
        descriptor: EventDescriptor,
        mode: DispatchMode,
        policy: Arc<dyn GrantPolicy>,
        clock: SharedClock,
    ) -> Self {
        Self {
            descriptor,
            mode,
            listeners: GrantRegistry::new(policy, clock),
            sequence: AtomicU64::new(0),
            cursor: AtomicUsize::new(0),
        }
    }

    /// The descriptor this dispatcher fires.
    #[must_use]
    pub const fn descriptor(&self) -> &EventDescriptor {
        &self.descriptor
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// The listener registry.
    #[must_use]
    pub const fn listeners(&self) -> &GrantRegistry<Listener> {
        &self.listeners
    }

    /// Number of listener resources still present (valid or not yet evicted).
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Grant a listener slot.
    ///
    /// # Errors
    /// Policy errors from the registry.
    pub fn add_listener(
        &self,
        target: SharedTarget,
        handback: Option<Handback>,
        requested: GrantDuration,
    ) -> Result<Grant, GrantError> {
        self.listeners.grant(Listener { target, handback }, requested)
    }

    /// Renew a listener's grant.
    ///
    /// # Errors
    /// `UnknownGrant` if the listener is gone.
    pub fn renew(&self, token: GrantToken, requested: GrantDuration) -> Result<crate::grant::Expiration, GrantError> {
        self.listeners.renew(token, requested)
    }

    /// Remove a listener. Idempotent.
    pub fn cancel(&self, token: GrantToken) -> bool {
        self.listeners.cancel(token)
    }

    /// Fire an event built from `payload`, stamped with the next sequence
    /// number and the registry clock's current time.
    ///
    /// # Errors
    /// `NoConsumer` under the rotating policy when no listener accepted it.
    pub fn fire(&self, payload: serde_json::Value) -> HeraldResult<FireReport> {
        // One sequence number per fire, shared by every listener.
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel);
        let event = Event::new(&self.descriptor, sequence, self.listeners.clock().now(), payload);
        match self.mode {
            DispatchMode::Broadcast => Ok(self.broadcast(&event)),
            DispatchMode::Rotating => self.rotate(&event),
        }
    }

    /// Sequence number the next `fire` will use.
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    fn broadcast(&self, event: &Event) -> FireReport {
        let mut report = FireReport {
            sequence: event.sequence,
            ..FireReport::default()
        };

        for (token, listener) in self.listeners.snapshot() {
            if !self.listeners.is_valid(token) {
                self.evict(token, RemovalReason::Expired);
                report.evicted += 1;
                continue;
            }

            match self.attempt(token, &listener, event) {
                Ok(()) => report.delivered += 1,
                Err(FailureClass::Retryable) => {}
                Err(_) => report.evicted += 1,
            }
        }

        report
    }

    fn rotate(&self, event: &Event) -> HeraldResult<FireReport> {
        let mut report = FireReport {
            sequence: event.sequence,
            ..FireReport::default()
        };
        let mut transient_failures = 0usize;

        loop {
            let snapshot = self.listeners.snapshot();
            if snapshot.is_empty() || transient_failures >= snapshot.len() {
                warn!(descriptor = %self.descriptor, sequence = event.sequence, "no consumer accepted event");
                return Err(HeraldError::NoConsumer {
                    type_code: self.descriptor.type_code,
                });
            }

            let idx = self.cursor.fetch_add(1, Ordering::AcqRel) % snapshot.len();
            let (token, listener) = &snapshot[idx];

            if !self.listeners.is_valid(*token) {
                self.evict(*token, RemovalReason::Expired);
                report.evicted += 1;
                continue;
            }

            match self.attempt(*token, listener, event) {
                Ok(()) => {
                    report.delivered = 1;
                    return Ok(report);
                }
                Err(FailureClass::Retryable) => transient_failures += 1,
                Err(_) => report.evicted += 1,
            }
        }
    }

    /// Deliver to one listener, evicting it on a terminal failure.
    fn attempt(&self, token: GrantToken, listener: &Listener, event: &Event) -> Result<(), FailureClass> {
        let outgoing = event.clone().with_handback(listener.handback.clone());
        let Err(err) = listener.target.deliver(&outgoing) else {
            return Ok(());
        };

        let class = err.class();
        if class.is_terminal() {
            debug!(token = %token, error = %err, "listener failed permanently");
            self.evict(token, RemovalReason::Revoked);
        } else {
            debug!(token = %token, error = %err, "listener failed transiently; keeping grant");
        }
        Err(class)
    }

    fn evict(&self, token: GrantToken, reason: RemovalReason) {
        if self.listeners.remove(token, reason).is_some() {
            debug!(descriptor = %self.descriptor, token = %token, ?reason, "listener evicted");
        }
    }
}
