//! Server-side fan-out.
//!
//! Producers deliver each fired event to the listeners holding a valid grant,
//! either to all of them (broadcast) or to exactly one in rotation. Listeners
//! whose grant lapsed, or whose delivery failed permanently, are evicted as a
//! side effect of firing.

/// Broadcast and rotating dispatchers.
pub mod fanout;
/// Producer surface and the in-process producer.
pub mod producer;
/// Delivery target trait and channel-backed targets.
pub mod target;

pub use fanout::{DispatchMode, FanoutDispatcher, FireReport, Listener};
pub use producer::{EventProducer, LocalProducer, ProducerId, SharedProducer, Subscription};
pub use target::{ChannelTarget, DeliveryTarget, EventStream, FnTarget, SharedTarget};
