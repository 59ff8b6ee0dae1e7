//! Durable event collection.
//!
//! A [`DurableCollector`] stores every event it is handed and forwards it to
//! each registration that has a live target attached. Attaching a target
//! first replays stored history from the registration's cursor on a pool
//! thread; live events that arrive meanwhile are buffered and handed over
//! once the scan finishes, so the target sees each event exactly once.
//!
//! Threads:
//! - `herald-ingest`: drains the ingestion queue and runs [`DurableCollector::notify`]
//!   for each event in arrival order.
//! - `herald-replay-N`: history replay, one job per attach.
//! - `herald-reaper`: evicts registrations whose grant has lapsed.

/// Collector configuration.
pub mod config;
mod pool;
/// Durable and live registration state.
pub mod registration;

pub use config::CollectorConfig;
pub use registration::{RegistrationInfo, RegistrationRecord};

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::dispatch::{DeliveryTarget, SharedTarget};
use crate::error::{DeliveryError, FailureClass, HeraldError, HeraldResult};
use crate::event::{Event, EventCursor, EventId};
use crate::grant::{Expiration, Grant, GrantDuration, GrantRegistry, GrantToken, RemovalReason};
use crate::store::EventStore;
#[cfg(feature = "persistent")]
use crate::store::{DataDir, FileJournal, RecordDir};
use crate::time::{system_clock, SharedClock};

use pool::ReplayPool;
use registration::{Registration, RegistrationState};

/// Counters exposed through [`DurableCollector::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectorStats {
    /// Events stored.
    pub ingested: u64,
    /// Events dropped because their key was already stored.
    pub duplicates: u64,
    /// Live deliveries that succeeded.
    pub delivered: u64,
    /// Replay and hand-off deliveries that succeeded.
    pub replayed: u64,
    /// Deliveries skipped because the target had rejected the type.
    pub suppressed: u64,
    /// Registrations evicted after an unrecoverable failure.
    pub revoked: u64,
    /// Registrations evicted because their grant lapsed.
    pub reaped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    ingested: AtomicU64,
    duplicates: AtomicU64,
    delivered: AtomicU64,
    replayed: AtomicU64,
    suppressed: AtomicU64,
    revoked: AtomicU64,
    reaped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CollectorStats {
        CollectorStats {
            ingested: self.ingested.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            revoked: self.revoked.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

enum IngestCommand {
    Event(Box<Event>),
    Drain(Sender<()>),
}

/// Outcome of one delivery attempt that did not end the registration.
enum Attempt {
    Delivered,
    Skipped,
}

struct Inner {
    registrations: GrantRegistry<Arc<Registration>>,
    store: EventStore,
    #[cfg(feature = "persistent")]
    records: Option<RecordDir>,
    counters: Arc<Counters>,
    /// Held from append until the event has been routed to every
    /// registration. Replay snapshots and detaches take it so an event is
    /// either in the snapshot or routed after it, never both. Always taken
    /// before any registration lock.
    routing: Mutex<()>,
    stopped: AtomicBool,
}

impl Inner {
    /// Store the event and fan it out to every attached registration.
    fn notify(&self, event: Event) {
        let _routing = self.routing.lock();
        if !self.store.append(event.clone()) {
            bump(&self.counters.duplicates);
            return;
        }
        bump(&self.counters.ingested);

        for (token, registration) in self.registrations.snapshot() {
            if !self.registrations.is_valid(token) {
                continue;
            }
            let failure = {
                let mut state = registration.state.lock();
                let Some(target) = state.target.clone() else {
                    continue;
                };
                if state.replaying {
                    state.missed.push(event.clone());
                    continue;
                }
                match self.attempt(token, &mut state, &target, &event) {
                    Ok(Attempt::Delivered) => {
                        bump(&self.counters.delivered);
                        continue;
                    }
                    Ok(Attempt::Skipped) => continue,
                    Err(e) => e,
                }
            };
            self.revoke(token, &failure);
        }
    }

    /// Try one delivery under the registration's lock. Only unrecoverable
    /// failures come back as errors; everything else is absorbed here.
    fn attempt(
        &self,
        token: GrantToken,
        state: &mut RegistrationState,
        target: &SharedTarget,
        event: &Event,
    ) -> Result<Attempt, DeliveryError> {
        if state.is_rejected(&event.kind) {
            state.mark_rejected(event);
            state.advance(event.key());
            bump(&self.counters.suppressed);
            return Ok(Attempt::Skipped);
        }

        let Err(e) = target.deliver(event) else {
            state.advance(event.key());
            return Ok(Attempt::Delivered);
        };
        match e.class() {
            FailureClass::Unrecognized => {
                info!(token = %token, kind = %event.kind, "target rejected event type");
                state.mark_rejected(event);
                state.advance(event.key());
                Ok(Attempt::Skipped)
            }
            FailureClass::Retryable => {
                warn!(token = %token, event = %event.key(), error = %e, "delivery failed, will not retry");
                Ok(Attempt::Skipped)
            }
            FailureClass::Unrecoverable => Err(e),
        }
    }

    fn revoke(&self, token: GrantToken, cause: &DeliveryError) {
        warn!(token = %token, error = %cause, "revoking registration");
        self.registrations.revoke(token);
    }

    /// Replay stored history beyond `cursor`, then hand over to live delivery.
    fn replay(&self, token: GrantToken, registration: &Registration, epoch: u64, cursor: EventCursor) {
        let history = {
            let _routing = self.routing.lock();
            self.store.query(&cursor)
        };
        info!(token = %token, events = history.len(), "replay started");

        let mut replayed = HashSet::with_capacity(history.len());
        for event in &history {
            if self.stopped.load(Ordering::Acquire) {
                debug!(token = %token, "replay interrupted by shutdown");
                return;
            }
            let mut state = registration.state.lock();
            if state.epoch != epoch {
                debug!(token = %token, "replay superseded");
                return;
            }
            let Some(target) = state.target.clone() else {
                return;
            };
            match self.attempt(token, &mut state, &target, event) {
                Ok(attempt) => {
                    if matches!(attempt, Attempt::Delivered) {
                        bump(&self.counters.replayed);
                    }
                    replayed.insert(event.key());
                }
                Err(e) => {
                    warn!(token = %token, event = %event.key(), error = %e, "replay aborted");
                    state.last_replay_error = Some(e);
                    state.detach();
                    self.persist(token, &state);
                    return;
                }
            }
        }

        let failure = {
            let mut state = registration.state.lock();
            if state.epoch != epoch {
                return;
            }
            let missed = std::mem::take(&mut state.missed);
            let mut failure = None;
            for event in missed.iter().filter(|e| !replayed.contains(&e.key())) {
                let Some(target) = state.target.clone() else {
                    break;
                };
                match self.attempt(token, &mut state, &target, event) {
                    Ok(Attempt::Delivered) => bump(&self.counters.replayed),
                    Ok(Attempt::Skipped) => {}
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            state.replaying = false;
            info!(token = %token, replayed = replayed.len(), handed_over = missed.len(), "replay finished");
            failure
        };
        if let Some(e) = failure {
            self.revoke(token, &e);
        }
    }

    /// Write the registration's durable record. Called with its lock held so
    /// the record matches the state it was taken from.
    #[cfg(feature = "persistent")]
    fn persist(&self, token: GrantToken, state: &RegistrationState) {
        let Some(records) = &self.records else {
            return;
        };
        let Some(expiration) = self.registrations.expiration(token) else {
            return;
        };
        let record = state.record(token, expiration);
        if let Err(e) = records.write(&RegistrationRecord::file_name(token), &record) {
            error!(token = %token, error = %e, "failed to persist registration");
        }
    }

    #[cfg(not(feature = "persistent"))]
    #[allow(clippy::unused_self)]
    fn persist(&self, _token: GrantToken, _state: &RegistrationState) {}
}

/// Collects events durably and delivers them to registered listeners.
pub struct DurableCollector {
    inner: Arc<Inner>,
    ingest_tx: Mutex<Option<Sender<IngestCommand>>>,
    ingest_join: Mutex<Option<JoinHandle<()>>>,
    reaper_stop: Mutex<Option<Sender<()>>>,
    reaper_join: Mutex<Option<JoinHandle<()>>>,
    pool: ReplayPool,
    #[cfg(feature = "persistent")]
    journal: Option<Arc<FileJournal>>,
    #[cfg(feature = "persistent")]
    _data: Option<DataDir>,
    terminated: AtomicBool,
}

impl fmt::Debug for DurableCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableCollector")
            .field("registrations", &self.inner.registrations.len())
            .field("store", &self.inner.store)
            .field("pool", &self.pool)
            .field("terminated", &self.terminated.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DurableCollector {
    /// Open a collector on the system clock.
    ///
    /// # Errors
    /// Invalid configuration, an unusable or locked data directory, or a
    /// worker thread that cannot be spawned.
    pub fn open(config: CollectorConfig) -> HeraldResult<Self> {
        Self::open_with_clock(config, system_clock())
    }

    /// Open a collector that judges grant expiry by `clock`.
    ///
    /// With persistence configured, stored events are reloaded first, then
    /// every registration whose grant is still valid. Reloaded registrations
    /// have no target until [`enable_delivery`](Self::enable_delivery) is
    /// called again.
    ///
    /// # Errors
    /// See [`open`](Self::open).
    pub fn open_with_clock(config: CollectorConfig, clock: SharedClock) -> HeraldResult<Self> {
        let config = config.validate()?;
        let counters = Arc::new(Counters::default());
        let registrations: GrantRegistry<Arc<Registration>> =
            GrantRegistry::new(Arc::new(config.policy()), clock);

        #[cfg(feature = "persistent")]
        let (data, journal, store, records) = match &config.persistence {
            Some(persistence) => {
                let data = DataDir::open(&persistence.data_dir, persistence.sync_on_write)?;
                let journal = Arc::new(FileJournal::start(data.events().clone())?);
                let store = EventStore::with_journal(journal.clone())?;
                let records = data.registrations().clone();
                restore_registrations(&registrations, &records)?;
                (Some(data), Some(journal), store, Some(records))
            }
            None => (None, None, EventStore::new(), None),
        };

        #[cfg(not(feature = "persistent"))]
        let store = match &config.persistence {
            Some(_) => {
                return Err(HeraldError::InvalidConfig {
                    reason: "persistence requires the `persistent` feature".to_string(),
                })
            }
            None => EventStore::new(),
        };

        let hook_counters = Arc::clone(&counters);
        #[cfg(feature = "persistent")]
        let hook_records = records.clone();
        registrations.set_removal_hook(Box::new(
            move |token: GrantToken, registration: &Arc<Registration>, reason: RemovalReason| {
                registration.state.lock().detach();
                match reason {
                    RemovalReason::Expired => bump(&hook_counters.reaped),
                    RemovalReason::Revoked => bump(&hook_counters.revoked),
                    RemovalReason::Cancelled => {}
                }
                #[cfg(feature = "persistent")]
                if let Some(records) = &hook_records {
                    if let Err(e) = records.remove(&RegistrationRecord::file_name(token)) {
                        error!(token = %token, error = %e, "failed to remove registration record");
                    }
                }
                info!(token = %token, ?reason, "registration removed");
            },
        ));

        let inner = Arc::new(Inner {
            registrations,
            store,
            #[cfg(feature = "persistent")]
            records,
            counters,
            routing: Mutex::new(()),
            stopped: AtomicBool::new(false),
        });

        let pool = ReplayPool::start(config.replay_workers, config.replay_queue_capacity)?;

        let (ingest_tx, ingest_rx) = unbounded::<IngestCommand>();
        let worker = Arc::clone(&inner);
        let ingest_join = thread::Builder::new()
            .name("herald-ingest".to_string())
            .spawn(move || ingest_loop(&worker, &ingest_rx))
            .map_err(|e| HeraldError::internal(format!("failed to spawn ingest worker: {e}")))?;

        let (reaper_stop, stop_rx) = bounded::<()>(1);
        let worker = Arc::clone(&inner);
        let interval = config.reaper_interval;
        let reaper_join = thread::Builder::new()
            .name("herald-reaper".to_string())
            .spawn(move || reaper_loop(&worker, &stop_rx, interval))
            .map_err(|e| HeraldError::internal(format!("failed to spawn reaper: {e}")))?;

        info!(
            registrations = inner.registrations.len(),
            events = inner.store.len(),
            "collector started"
        );

        Ok(Self {
            inner,
            ingest_tx: Mutex::new(Some(ingest_tx)),
            ingest_join: Mutex::new(Some(ingest_join)),
            reaper_stop: Mutex::new(Some(reaper_stop)),
            reaper_join: Mutex::new(Some(reaper_join)),
            pool,
            #[cfg(feature = "persistent")]
            journal,
            #[cfg(feature = "persistent")]
            _data: data,
            terminated: AtomicBool::new(false),
        })
    }

    fn registration(&self, token: GrantToken) -> HeraldResult<Arc<Registration>> {
        self.inner
            .registrations
            .get(token)
            .ok_or(HeraldError::UnknownRegistration { token })
    }

    /// Create a registration with no target attached.
    ///
    /// # Errors
    /// `InvalidDuration` for a zero finite duration, `GrantDenied` if the
    /// policy refuses.
    pub fn register(&self, duration: GrantDuration) -> HeraldResult<Grant> {
        let registration = Arc::new(Registration::default());
        let grant = self.inner.registrations.grant(Arc::clone(&registration), duration)?;
        self.inner.persist(grant.token, &registration.state.lock());
        info!(token = %grant.token, expiration = ?grant.expiration, "registered");
        Ok(grant)
    }

    /// Attach `target` and start replaying history from the registration's
    /// cursor. Returns as soon as the replay is queued.
    ///
    /// If a replay is already running for this registration its target is
    /// replaced instead. Replay failures are reported through
    /// [`last_replay_error`](Self::last_replay_error).
    ///
    /// # Errors
    /// `UnknownRegistration` if the token is absent or expired; `QueueFull`
    /// or `Disconnected` if the replay cannot be queued, in which case the
    /// target is detached again.
    pub fn enable_delivery(&self, token: GrantToken, target: SharedTarget) -> HeraldResult<()> {
        let registration = self.registration(token)?;

        let (epoch, cursor) = {
            let mut state = registration.state.lock();
            state.target = Some(target);
            if state.replaying {
                debug!(token = %token, "replay target replaced");
                return Ok(());
            }
            state.replaying = true;
            state.missed.clear();
            state.last_replay_error = None;
            state.epoch += 1;
            self.inner.persist(token, &state);
            (state.epoch, state.cursor)
        };

        let inner = Arc::clone(&self.inner);
        let job_registration = Arc::clone(&registration);
        let submitted = self.pool.try_submit(Box::new(move || {
            inner.replay(token, &job_registration, epoch, cursor);
        }));

        if let Err(e) = submitted {
            let mut state = registration.state.lock();
            if state.epoch == epoch {
                state.detach();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Detach the target. The cursor moves to the store's high-water mark so
    /// a later attach resumes with events stored from now on.
    ///
    /// # Errors
    /// `UnknownRegistration` if the token is absent or expired.
    pub fn disable_delivery(&self, token: GrantToken) -> HeraldResult<()> {
        let registration = self.registration(token)?;
        let _routing = self.inner.routing.lock();
        let mut state = registration.state.lock();
        state.detach();
        if let EventCursor::After(key) = self.inner.store.high_water_mark() {
            state.advance(key);
        }
        self.inner.persist(token, &state);
        debug!(token = %token, cursor = ?state.cursor, "delivery disabled");
        Ok(())
    }

    /// Renew a registration's grant.
    ///
    /// # Errors
    /// `UnknownGrant` if the token is absent or expired.
    pub fn renew(&self, token: GrantToken, duration: GrantDuration) -> HeraldResult<Expiration> {
        let expiration = self.inner.registrations.renew(token, duration)?;
        if let Some(registration) = self.inner.registrations.get(token) {
            self.inner.persist(token, &registration.state.lock());
        }
        Ok(expiration)
    }

    /// Cancel a registration and delete its record.
    ///
    /// # Errors
    /// `UnknownGrant` if the token is absent.
    pub fn cancel(&self, token: GrantToken) -> HeraldResult<()> {
        if self.inner.registrations.cancel(token) {
            Ok(())
        } else {
            Err(HeraldError::unknown_grant(token))
        }
    }

    /// Delete stored events by identity and drop rejection markers that
    /// referenced them. Returns the number of stored events removed.
    ///
    /// # Errors
    /// If a persisted event record could not be removed. The events are gone
    /// from memory and the markers are purged even then.
    pub fn delete(&self, ids: &[EventId]) -> HeraldResult<usize> {
        let removed = self.inner.store.delete(ids);
        for (token, registration) in self.inner.registrations.snapshot() {
            let mut state = registration.state.lock();
            if state.purge(ids) {
                self.inner.persist(token, &state);
            }
        }
        Ok(removed?)
    }

    /// Store `event` and deliver it to attached registrations on the calling
    /// thread.
    ///
    /// This is what the ingestion worker runs for each queued event. Calling
    /// it directly bypasses the queue, so arrival order is only as good as
    /// the caller's own ordering.
    pub fn notify(&self, event: Event) {
        self.inner.notify(event);
    }

    /// Queue `event` for the ingestion worker.
    ///
    /// # Errors
    /// `Disconnected` after [`terminate`](Self::terminate).
    pub fn ingest(&self, event: Event) -> HeraldResult<()> {
        self.send(IngestCommand::Event(Box::new(event)))
    }

    /// Wait until every event queued before this call has been processed.
    ///
    /// # Errors
    /// `Disconnected` after [`terminate`](Self::terminate).
    pub fn drain(&self) -> HeraldResult<()> {
        let (reply, done) = bounded(1);
        self.send(IngestCommand::Drain(reply))?;
        done.recv().map_err(|_| HeraldError::disconnected("ingest"))
    }

    fn send(&self, command: IngestCommand) -> HeraldResult<()> {
        let tx = self.ingest_tx.lock();
        let sender = tx.as_ref().ok_or_else(|| HeraldError::disconnected("ingest"))?;
        sender.send(command).map_err(|_| HeraldError::disconnected("ingest"))
    }

    /// Why the last replay for `token` stopped early, if it did.
    #[must_use]
    pub fn last_replay_error(&self, token: GrantToken) -> Option<DeliveryError> {
        self.inner
            .registrations
            .get(token)
            .and_then(|r| r.state.lock().last_replay_error.clone())
    }

    /// Snapshot of a live registration.
    #[must_use]
    pub fn registration_info(&self, token: GrantToken) -> Option<RegistrationInfo> {
        let registration = self.inner.registrations.get(token)?;
        let expiration = self.inner.registrations.expiration(token)?;
        Some(registration.info(token, expiration))
    }

    /// True if `token` names a registration whose grant is still valid.
    #[must_use]
    pub fn is_registered(&self, token: GrantToken) -> bool {
        self.inner.registrations.is_valid(token)
    }

    /// Tokens of all valid registrations, oldest first.
    #[must_use]
    pub fn tokens(&self) -> Vec<GrantToken> {
        self.inner
            .registrations
            .snapshot()
            .into_iter()
            .map(|(token, _)| token)
            .filter(|token| self.inner.registrations.is_valid(*token))
            .collect()
    }

    /// Run one reaper pass now. Returns the evicted tokens.
    pub fn reap(&self) -> Vec<GrantToken> {
        self.inner.registrations.reap_expired()
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn store(&self) -> &EventStore {
        &self.inner.store
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn stats(&self) -> CollectorStats {
        self.inner.counters.snapshot()
    }

    /// Stop ingestion, the reaper and replay, and flush pending writes.
    /// Events already queued are processed first. Idempotent.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }

        self.ingest_tx.lock().take();
        if let Some(handle) = self.ingest_join.lock().take() {
            let _ = handle.join();
        }

        self.inner.stopped.store(true, Ordering::Release);
        self.reaper_stop.lock().take();
        if let Some(handle) = self.reaper_join.lock().take() {
            let _ = handle.join();
        }
        self.pool.shutdown();

        if let Err(e) = self.inner.store.flush() {
            warn!(error = %e, "failed to flush event journal");
        }
        #[cfg(feature = "persistent")]
        if let Some(journal) = &self.journal {
            journal.close();
        }
        info!("collector terminated");
    }
}

impl DeliveryTarget for DurableCollector {
    fn deliver(&self, event: &Event) -> Result<(), DeliveryError> {
        self.ingest(event.clone())
            .map_err(|_| DeliveryError::unrecoverable("collector terminated"))
    }
}

impl Drop for DurableCollector {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn ingest_loop(inner: &Inner, rx: &Receiver<IngestCommand>) {
    for command in rx {
        match command {
            IngestCommand::Event(event) => inner.notify(*event),
            IngestCommand::Drain(reply) => {
                let _ = reply.send(());
            }
        }
    }
    debug!("ingest worker exiting");
}

fn reaper_loop(inner: &Inner, stop_rx: &Receiver<()>, interval: Duration) {
    loop {
        let stop = select! {
            recv(stop_rx) -> _ => true,
            default(interval) => false,
        };
        if stop {
            break;
        }
        let reaped = inner.registrations.reap_expired();
        if !reaped.is_empty() {
            info!(count = reaped.len(), "reaped expired registrations");
        }
    }
    debug!("reaper exiting");
}

#[cfg(feature = "persistent")]
fn restore_registrations(
    registrations: &GrantRegistry<Arc<Registration>>,
    records: &RecordDir,
) -> HeraldResult<usize> {
    let now = registrations.clock().now();
    let mut restored = 0usize;
    for (name, record) in records.load_all::<RegistrationRecord>("reg-")? {
        if name != RegistrationRecord::file_name(record.token) || !record.expiration.is_live(now) {
            debug!(record = %name, "discarding lapsed registration record");
            records.remove(&name)?;
            continue;
        }
        let token = record.token;
        let expiration = record.expiration;
        registrations.restore(token, Arc::new(Registration::restored(record)), expiration);
        restored += 1;
    }
    info!(registrations = restored, "registrations reloaded");
    Ok(restored)
}
