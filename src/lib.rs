//! # herald - Leased Event Distribution
//!
//! herald moves events from producers to consumers under time-bounded grants.
//! Nothing is permanent: every listener, connection and registration holds a
//! grant that lapses unless renewed, and lapsed holders are evicted.
//!
//! ## Core Concepts
//!
//! - **Grant**: a token with an expiration, issued and renewed by a [`GrantRegistry`]
//! - **Fan-out**: a [`FanoutDispatcher`] delivers each event to every listener
//!   (broadcast) or to exactly one (rotating)
//! - **Subscription**: a [`SubscriptionClient`] keeps grants on remote producers
//!   alive and funnels their events into one local target
//! - **Collection**: a [`DurableCollector`] stores events, replays history to newly
//!   attached listeners and survives restarts
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use herald::{ChannelTarget, CollectorConfig, DurableCollector, GrantDuration};
//!
//! let collector = DurableCollector::open(CollectorConfig::persistent("/var/lib/herald"))?;
//! let grant = collector.register(GrantDuration::secs(60))?;
//!
//! let (target, stream) = ChannelTarget::unbounded();
//! collector.enable_delivery(grant.token, Arc::new(target))?;
//! while let Ok(event) = stream.recv() {
//!     println!("{} #{}", event.kind, event.sequence);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod event;
pub mod grant;
pub mod time;

// Delivery
pub mod client;
pub mod dispatch;

// Storage and collection
pub mod collector;
pub mod store;

pub use client::{
    ClientConfig, ConnectionKey, ConnectionState, DiscoveryContext, DiscoveryEvent, ProducerDiscovery,
    SubscriptionClient,
};
pub use collector::{CollectorConfig, CollectorStats, DurableCollector, RegistrationInfo, RegistrationRecord};
pub use dispatch::{
    ChannelTarget, DeliveryTarget, DispatchMode, EventProducer, EventStream, FanoutDispatcher, FireReport,
    FnTarget, LocalProducer, ProducerId, SharedProducer, SharedTarget, Subscription,
};
pub use error::{DeliveryError, FailureClass, GrantError, HeraldError, HeraldResult, StorageError};
pub use event::{Event, EventCursor, EventDescriptor, EventId, EventKey, Handback};
pub use grant::{
    Expiration, FixedCeilingPolicy, Grant, GrantDuration, GrantPolicy, GrantRegistry, GrantToken, RemovalReason,
};
pub use store::{EventJournal, EventStore, PersistenceConfig};
pub use time::{Clock, ManualClock, SharedClock, SystemClock};
