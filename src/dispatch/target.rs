//! Delivery targets.
//!
//! A [`DeliveryTarget`] is whatever sits at the far end of a subscription: a
//! remote listener behind a transport, the local fan-in point of a
//! subscription client, or the collector's ingestion queue.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::error::{DeliveryError, HeraldError, HeraldResult};
use crate::event::Event;

/// Receives events.
pub trait DeliveryTarget: Send + Sync {
    /// Deliver one event.
    ///
    /// # Errors
    /// `UnrecognizedEvent` if the target cannot interpret the event's type,
    /// a transport error otherwise.
    fn deliver(&self, event: &Event) -> Result<(), DeliveryError>;
}

/// Shared handle to a delivery target.
pub type SharedTarget = Arc<dyn DeliveryTarget>;

impl<T: DeliveryTarget + ?Sized> DeliveryTarget for Arc<T> {
    fn deliver(&self, event: &Event) -> Result<(), DeliveryError> {
        (**self).deliver(event)
    }
}

/// Adapts a closure into a target.
pub struct FnTarget<F>(pub F);

impl<F> DeliveryTarget for FnTarget<F>
where
    F: Fn(&Event) -> Result<(), DeliveryError> + Send + Sync,
{
    fn deliver(&self, event: &Event) -> Result<(), DeliveryError> {
        (self.0)(event)
    }
}

impl<F> fmt::Debug for FnTarget<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnTarget")
    }
}

/// Channel-backed target. Pair it with the [`EventStream`] returned by
/// [`ChannelTarget::bounded`] or [`ChannelTarget::unbounded`].
///
/// A full channel is a retryable failure; a dropped stream is unrecoverable.
#[derive(Debug, Clone)]
pub struct ChannelTarget {
    tx: Sender<Event>,
}

impl ChannelTarget {
    /// Target with a bounded buffer.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, EventStream) {
        let (tx, rx) = bounded(capacity.max(1));
        (Self { tx }, EventStream { rx })
    }

    /// Target with an unbounded buffer.
    #[must_use]
    pub fn unbounded() -> (Self, EventStream) {
        let (tx, rx) = unbounded();
        (Self { tx }, EventStream { rx })
    }
}

impl DeliveryTarget for ChannelTarget {
    fn deliver(&self, event: &Event) -> Result<(), DeliveryError> {
        match self.tx.try_send(event.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DeliveryError::retryable("event stream is full")),
            Err(TrySendError::Disconnected(_)) => Err(DeliveryError::unrecoverable("event stream closed")),
        }
    }
}

/// Receiving half of a [`ChannelTarget`].
#[derive(Debug)]
pub struct EventStream {
    rx: Receiver<Event>,
}

impl EventStream {
    /// Receive the next event (blocking).
    ///
    /// # Errors
    /// `Disconnected` once every sender is gone.
    pub fn recv(&self) -> HeraldResult<Event> {
        self.rx.recv().map_err(|_| HeraldError::disconnected("event_stream"))
    }

    /// Receive the next event with a timeout. `Ok(None)` on timeout.
    ///
    /// # Errors
    /// `Disconnected` once every sender is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> HeraldResult<Option<Event>> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(HeraldError::disconnected("event_stream")),
        }
    }

    /// Collect exactly `n` events, or fewer if `timeout` passes first.
    #[must_use]
    pub fn collect(&self, n: usize, timeout: Duration) -> Vec<Event> {
        let deadline = std::time::Instant::now() + timeout;
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let left = deadline.saturating_duration_since(std::time::Instant::now());
            match self.rx.recv_timeout(left) {
                Ok(event) => out.push(event),
                Err(_) => break,
            }
        }
        out
    }

    /// Drain whatever is buffered without blocking.
    #[must_use]
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }
}
