use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GrantError, HeraldError, HeraldResult};
use crate::event::{EventDescriptor, Handback};
use crate::grant::{Expiration, Grant, GrantDuration, GrantPolicy, GrantToken};
use crate::time::SharedClock;

use super::fanout::{DispatchMode, FanoutDispatcher, FireReport};
use super::target::SharedTarget;

/// Identity of an event producer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProducerId(String);

impl ProducerId {
    #[allow(missing_docs)]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a successful subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// The listener grant.
    pub grant: Grant,
    /// Who granted it.
    pub source: ProducerId,
}

/// Logical producer surface consumed by the subscription client.
pub trait EventProducer: Send + Sync {
    /// Producer identity.
    fn id(&self) -> ProducerId;

    /// Event types this producer advertises.
    fn descriptors(&self) -> Vec<EventDescriptor>;

    /// Register `target` for events matching `descriptor`.
    ///
    /// # Errors
    /// Grant errors, or transport errors classified per the taxonomy.
    fn subscribe(
        &self,
        descriptor: &EventDescriptor,
        target: SharedTarget,
        handback: Option<Handback>,
        duration: GrantDuration,
    ) -> HeraldResult<Subscription>;

    /// Renew a listener grant.
    ///
    /// # Errors
    /// `UnknownGrant` if the listener is gone.
    fn renew(&self, token: GrantToken, duration: GrantDuration) -> HeraldResult<Expiration>;

    /// Drop a listener grant.
    ///
    /// # Errors
    /// `UnknownGrant` if the listener is gone.
    fn cancel(&self, token: GrantToken) -> HeraldResult<()>;
}

/// Shared handle to a producer.
pub type SharedProducer = Arc<dyn EventProducer>;

/// In-process producer: one fan-out dispatcher per advertised descriptor.
pub struct LocalProducer {
    id: ProducerId,
    policy: Arc<dyn GrantPolicy>,
    clock: SharedClock,
    dispatchers: HashMap<u64, Arc<FanoutDispatcher>>,
    routes: DashMap<GrantToken, u64>,
}

impl fmt::Debug for LocalProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalProducer")
            .field("id", &self.id)
            .field("dispatchers", &self.dispatchers.len())
            .finish_non_exhaustive()
    }
}

impl LocalProducer {
    /// Producer advertising nothing yet.
    pub fn new(id: ProducerId, policy: Arc<dyn GrantPolicy>, clock: SharedClock) -> Self {
        Self {
            id,
            policy,
            clock,
            dispatchers: HashMap::new(),
            routes: DashMap::new(),
        }
    }

    /// Advertise a descriptor fired under `mode`.
    #[must_use]
    pub fn advertise(mut self, descriptor: EventDescriptor, mode: DispatchMode) -> Self {
        let dispatcher = FanoutDispatcher::new(
            descriptor.clone(),
            mode,
            Arc::clone(&self.policy),
            Arc::clone(&self.clock),
        );
        self.dispatchers.insert(descriptor.type_code, Arc::new(dispatcher));
        self
    }

    /// Dispatcher for a type code.
    #[must_use]
    pub fn dispatcher(&self, type_code: u64) -> Option<&Arc<FanoutDispatcher>> {
        self.dispatchers.get(&type_code)
    }

    /// Fire an event of an advertised type.
    ///
    /// # Errors
    /// `GrantDenied` for a type this producer does not advertise,
    /// `NoConsumer` from a rotating dispatcher.
    pub fn fire(&self, type_code: u64, payload: serde_json::Value) -> HeraldResult<FireReport> {
        self.dispatchers
            .get(&type_code)
            .ok_or_else(|| not_advertised(type_code))?
            .fire(payload)
    }

    fn route(&self, token: GrantToken) -> HeraldResult<&Arc<FanoutDispatcher>> {
        let type_code = *self
            .routes
            .get(&token)
            .ok_or_else(|| HeraldError::unknown_grant(token))?;
        self.dispatchers
            .get(&type_code)
            .ok_or_else(|| HeraldError::unknown_grant(token))
    }
}

fn not_advertised(type_code: u64) -> HeraldError {
    GrantError::GrantDenied {
        reason: format!("event type {type_code} is not advertised"),
    }
    .into()
}

impl EventProducer for LocalProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn descriptors(&self) -> Vec<EventDescriptor> {
        let mut out: Vec<EventDescriptor> = self.dispatchers.values().map(|d| d.descriptor().clone()).collect();
        out.sort_by_key(|d| d.type_code);
        out
    }

    fn subscribe(
        &self,
        descriptor: &EventDescriptor,
        target: SharedTarget,
        handback: Option<Handback>,
        duration: GrantDuration,
    ) -> HeraldResult<Subscription> {
        let dispatcher = self
            .dispatchers
            .get(&descriptor.type_code)
            .ok_or_else(|| not_advertised(descriptor.type_code))?;
        let grant = dispatcher.add_listener(target, handback, duration)?;
        self.routes.insert(grant.token, descriptor.type_code);
        debug!(producer = %self.id, descriptor = %descriptor, token = %grant.token, "listener subscribed");
        Ok(Subscription {
            grant,
            source: self.id.clone(),
        })
    }

    fn renew(&self, token: GrantToken, duration: GrantDuration) -> HeraldResult<Expiration> {
        let result = self.route(token)?.renew(token, duration);
        if matches!(result, Err(GrantError::UnknownGrant { .. })) {
            self.routes.remove(&token);
        }
        Ok(result?)
    }

    fn cancel(&self, token: GrantToken) -> HeraldResult<()> {
        let dispatcher = self.route(token)?;
        self.routes.remove(&token);
        if dispatcher.cancel(token) {
            Ok(())
        } else {
            Err(HeraldError::unknown_grant(token))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dispatch::target::ChannelTarget;
    use crate::grant::FixedCeilingPolicy;
    use crate::time::ManualClock;

    fn producer(clock: &ManualClock) -> LocalProducer {
        LocalProducer::new(
            ProducerId::new("p1"),
            Arc::new(FixedCeilingPolicy::new(Duration::from_secs(30))),
            Arc::new(clock.clone()),
        )
        .advertise(EventDescriptor::new("a", 1), DispatchMode::Broadcast)
        .advertise(EventDescriptor::new("b", 2), DispatchMode::Rotating)
    }

    #[test]
    fn test_subscribe_and_fire() {
        let clock = ManualClock::new();
        let p = producer(&clock);
        let (t, s) = ChannelTarget::unbounded();
        let sub = p
            .subscribe(&EventDescriptor::new("a", 1), Arc::new(t), Some(Handback::new("h")), GrantDuration::secs(10))
            .unwrap();
        assert_eq!(sub.source, ProducerId::new("p1"));

        p.fire(1, serde_json::json!({"x": 1})).unwrap();
        let got = s.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].handback, Some(Handback::new("h")));
    }

    #[test]
    fn test_subscribe_unknown_descriptor_denied() {
        let clock = ManualClock::new();
        let p = producer(&clock);
        let (t, _s) = ChannelTarget::unbounded();
        let err = p
            .subscribe(&EventDescriptor::new("zzz", 99), Arc::new(t), None, GrantDuration::secs(10))
            .unwrap_err();
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn test_renew_and_cancel_route_by_token() {
        let clock = ManualClock::new();
        let p = producer(&clock);
        let (t, _s) = ChannelTarget::unbounded();
        let sub = p
            .subscribe(&EventDescriptor::new("b", 2), Arc::new(t), None, GrantDuration::secs(10))
            .unwrap();
        p.renew(sub.grant.token, GrantDuration::secs(10)).unwrap();
        p.cancel(sub.grant.token).unwrap();
        assert!(p.cancel(sub.grant.token).is_err());
        assert!(p.renew(sub.grant.token, GrantDuration::secs(10)).unwrap_err().is_retryable());
    }

    #[test]
    fn test_descriptors_sorted() {
        let clock = ManualClock::new();
        let codes: Vec<u64> = producer(&clock).descriptors().iter().map(|d| d.type_code).collect();
        assert_eq!(codes, vec![1, 2]);
    }
}
