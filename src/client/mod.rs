//! Client-side subscription engine.
//!
//! [`SubscriptionClient`] holds one connection per (producer, event type):
//! it registers, renews the grant before it lapses, re-registers after
//! recoverable failures and gives up on unrecoverable ones.
//! [`ProducerDiscovery`] turns producer join/leave notifications into
//! connect/disconnect calls.

/// Join/leave handling.
pub mod discovery;
/// Connections and the renewal loop.
pub mod subscription;

pub use discovery::{DiscoveryContext, DiscoveryEvent, ProducerDiscovery};
pub use subscription::{ClientConfig, ConnectionKey, ConnectionState, SubscriptionClient};
