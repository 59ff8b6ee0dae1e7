//! In-memory ordered event log with optional journaling.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::error::StorageError;
use crate::event::{Event, EventCursor, EventId, EventKey};

use super::journal::EventJournal;

#[derive(Debug, Default)]
struct LogState {
    by_key: BTreeMap<EventKey, Event>,
    /// The same identity may sit under more than one key if a producer
    /// re-sent it with a drifted timestamp.
    by_id: HashMap<EventId, Vec<EventKey>>,
}

impl LogState {
    fn insert(&mut self, event: Event) -> bool {
        let key = event.key();
        if self.by_key.contains_key(&key) {
            return false;
        }
        self.by_id.entry(key.id()).or_default().push(key);
        self.by_key.insert(key, event);
        true
    }

    fn remove_id(&mut self, id: EventId) -> Vec<Event> {
        self.by_id
            .remove(&id)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|key| self.by_key.remove(&key))
            .collect()
    }
}

/// Ordered, de-duplicated event log keyed by (timestamp, type, sequence).
///
/// Appends with a key already present are ignored. Deletion goes by logical
/// identity (type, sequence) so it does not depend on the timestamp.
pub struct EventStore {
    state: RwLock<LogState>,
    journal: Option<Arc<dyn EventJournal>>,
    duplicates: AtomicU64,
}

impl fmt::Debug for EventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStore")
            .field("len", &self.len())
            .field("journal", &self.journal)
            .field("duplicates", &self.duplicates())
            .finish()
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    /// A volatile store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LogState::default()),
            journal: None,
            duplicates: AtomicU64::new(0),
        }
    }

    /// A store backed by `journal`, rebuilt from whatever it already holds.
    ///
    /// # Errors
    /// If the journal cannot be read.
    pub fn with_journal(journal: Arc<dyn EventJournal>) -> Result<Self, StorageError> {
        let mut state = LogState::default();
        let mut loaded = 0usize;
        for event in journal.load()? {
            if state.insert(event) {
                loaded += 1;
            }
        }
        info!(events = loaded, "event store reloaded");

        Ok(Self {
            state: RwLock::new(state),
            journal: Some(journal),
            duplicates: AtomicU64::new(0),
        })
    }

    /// Add `event`. Returns false, and changes nothing, if its key is
    /// already present.
    ///
    /// The journal write is queued under the log's write lock, so a delete
    /// that observes the event is always journaled after it.
    pub fn append(&self, event: Event) -> bool {
        let key = event.key();
        let mut state = self.state.write();
        if state.by_key.contains_key(&key) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "duplicate append ignored");
            return false;
        }

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record(&event) {
                error!(key = %key, error = %e, "failed to journal event");
            }
        }
        state.insert(event)
    }

    /// Every event with a key beyond `cursor`, in key order.
    #[must_use]
    pub fn query(&self, cursor: &EventCursor) -> Vec<Event> {
        let state = self.state.read();
        let range = match cursor {
            EventCursor::Unset => state.by_key.range::<EventKey, _>(..),
            EventCursor::After(key) => state.by_key.range((Bound::Excluded(*key), Bound::Unbounded)),
        };
        range.map(|(_, event)| event.clone()).collect()
    }

    /// Remove every event whose (type, sequence) is in `ids`. Returns the
    /// number of log entries removed; deleting an absent id counts zero.
    ///
    /// # Errors
    /// The first journal record that could not be removed. The in-memory
    /// removal has already happened and the remaining records are still
    /// attempted.
    pub fn delete(&self, ids: &[EventId]) -> Result<usize, StorageError> {
        let removed: Vec<Event> = {
            let mut state = self.state.write();
            ids.iter().flat_map(|id| state.remove_id(*id)).collect()
        };

        let mut first_error = None;
        if let Some(journal) = &self.journal {
            for event in &removed {
                if let Err(e) = journal.forget(event) {
                    error!(key = %event.key(), error = %e, "failed to forget event");
                    first_error.get_or_insert(e);
                }
            }
        }
        if !removed.is_empty() {
            debug!(removed = removed.len(), "events deleted");
        }
        first_error.map_or(Ok(removed.len()), Err)
    }

    /// Cursor positioned after the largest key, or `Unset` when empty.
    #[must_use]
    pub fn high_water_mark(&self) -> EventCursor {
        self.state
            .read()
            .by_key
            .last_key_value()
            .map_or(EventCursor::Unset, |(key, _)| EventCursor::After(*key))
    }

    /// Look an event up by identity. With several keys for one identity the
    /// earliest is returned.
    #[must_use]
    pub fn get(&self, id: EventId) -> Option<Event> {
        let state = self.state.read();
        let keys = state.by_id.get(&id)?;
        keys.iter()
            .min()
            .and_then(|key| state.by_key.get(key))
            .cloned()
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().by_key.len()
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().by_key.is_empty()
    }

    /// Appends ignored because their key was already present.
    #[must_use]
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Wait for the journal to catch up. A no-op without one.
    ///
    /// # Errors
    /// If the journal writer is gone.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.journal.as_ref().map_or(Ok(()), |j| j.flush())
    }
}
