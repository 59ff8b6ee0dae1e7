//! Collector-side registrations.
//!
//! A registration is split in two. [`RegistrationRecord`] is the durable part
//! that survives a restart. The live part (the delivery target, the replay
//! flag and the missed-event buffer) only exists inside the running process
//! and is rebuilt empty on reload.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::dispatch::SharedTarget;
use crate::error::DeliveryError;
use crate::event::{Event, EventCursor, EventId, EventKey};
use crate::grant::{Expiration, GrantToken};

/// Persisted form of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    #[allow(missing_docs)]
    pub token: GrantToken,
    #[allow(missing_docs)]
    pub expiration: Expiration,
    /// Replay resumes strictly after this position.
    pub cursor: EventCursor,
    /// Type identifiers the target refused, with the stored events that
    /// reference each marker.
    #[serde(default)]
    pub rejected: BTreeMap<String, BTreeSet<EventId>>,
}

impl RegistrationRecord {
    /// Record file name for `token`.
    #[must_use]
    pub fn file_name(token: GrantToken) -> String {
        format!("reg-{token}.rec")
    }
}

/// Point-in-time view of a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationInfo {
    #[allow(missing_docs)]
    pub token: GrantToken,
    #[allow(missing_docs)]
    pub expiration: Expiration,
    #[allow(missing_docs)]
    pub cursor: EventCursor,
    /// A live target is attached.
    pub attached: bool,
    /// History replay is in progress.
    pub replaying: bool,
    /// Live events held back until replay finishes.
    pub buffered: usize,
    /// Type identifiers currently suppressed.
    pub rejected_kinds: Vec<String>,
    /// Why the most recent replay stopped early, if it did.
    pub last_replay_error: Option<DeliveryError>,
}

#[derive(Default)]
pub(crate) struct RegistrationState {
    pub(crate) target: Option<SharedTarget>,
    pub(crate) cursor: EventCursor,
    pub(crate) rejected: BTreeMap<String, BTreeSet<EventId>>,
    pub(crate) replaying: bool,
    pub(crate) missed: Vec<Event>,
    pub(crate) last_replay_error: Option<DeliveryError>,
    /// Bumped whenever a replay starts or the target is detached, so a stale
    /// replay job can tell it has been superseded.
    pub(crate) epoch: u64,
}

impl RegistrationState {
    pub(crate) fn is_rejected(&self, kind: &str) -> bool {
        self.rejected.contains_key(kind)
    }

    /// Add a reference from `event` to its type's rejection marker.
    pub(crate) fn mark_rejected(&mut self, event: &Event) {
        self.rejected.entry(event.kind.clone()).or_default().insert(event.id());
    }

    /// Move the cursor forward to `key`; never backwards.
    pub(crate) fn advance(&mut self, key: EventKey) {
        if self.cursor.admits(&key) {
            self.cursor = EventCursor::After(key);
        }
    }

    /// Drop rejection references to deleted events. Returns true if anything
    /// changed.
    pub(crate) fn purge(&mut self, ids: &[EventId]) -> bool {
        let mut changed = false;
        self.rejected.retain(|_, refs| {
            for id in ids {
                changed |= refs.remove(id);
            }
            !refs.is_empty()
        });
        changed
    }

    /// The durable part of this state.
    #[cfg_attr(not(feature = "persistent"), allow(dead_code))]
    pub(crate) fn record(&self, token: GrantToken, expiration: Expiration) -> RegistrationRecord {
        RegistrationRecord {
            token,
            expiration,
            cursor: self.cursor,
            rejected: self.rejected.clone(),
        }
    }

    /// Forget the live attachment.
    pub(crate) fn detach(&mut self) {
        self.target = None;
        self.replaying = false;
        self.missed.clear();
        self.epoch += 1;
    }
}

/// One registration's live state behind its own lock. Deliveries to the
/// target happen under this lock, which keeps replay, buffering and live
/// delivery for one registration strictly ordered without touching others.
#[derive(Default)]
pub(crate) struct Registration {
    pub(crate) state: Mutex<RegistrationState>,
}

impl Registration {
    pub(crate) fn restored(record: RegistrationRecord) -> Self {
        Self {
            state: Mutex::new(RegistrationState {
                cursor: record.cursor,
                rejected: record.rejected,
                ..RegistrationState::default()
            }),
        }
    }

    pub(crate) fn info(&self, token: GrantToken, expiration: Expiration) -> RegistrationInfo {
        let state = self.state.lock();
        RegistrationInfo {
            token,
            expiration,
            cursor: state.cursor,
            attached: state.target.is_some(),
            replaying: state.replaying,
            buffered: state.missed.len(),
            rejected_kinds: state.rejected.keys().cloned().collect(),
            last_replay_error: state.last_replay_error.clone(),
        }
    }
}
