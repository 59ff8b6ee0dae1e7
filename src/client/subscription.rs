//! Per-producer connection manager.
//!
//! Each connection registers the consumer's target with one producer, then a
//! dedicated `herald-renew` thread keeps the grant alive by renewing it at a
//! fraction of the granted duration. Recoverable failures lead to a fresh
//! registration; unrecoverable ones abandon the connection for good.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::dispatch::{EventProducer, ProducerId, SharedProducer, SharedTarget};
use crate::error::{HeraldError, HeraldResult};
use crate::event::{EventDescriptor, Handback};
use crate::grant::{Grant, GrantDuration};
use crate::time::{system_clock, SharedClock};

/// Subscription client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Register attempts per connect before giving up.
    pub connect_attempts: u32,
    /// Fixed wait between connect attempts.
    pub retry_wait: Duration,
    /// Duration requested on every register and renew.
    pub default_duration: GrantDuration,
    /// Fraction of the granted duration to wait before renewing.
    pub renew_fraction: f64,
    /// Echo token sent with every registration.
    pub handback: Option<Handback>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            retry_wait: Duration::from_secs(1),
            default_duration: GrantDuration::secs(30),
            renew_fraction: 0.5,
            handback: None,
        }
    }
}

impl ClientConfig {
    /// Check the configuration.
    ///
    /// # Errors
    /// `InvalidConfig` when a value would make the client spin or never renew.
    pub fn validate(self) -> HeraldResult<Self> {
        if self.connect_attempts == 0 {
            return Err(HeraldError::InvalidConfig {
                reason: "connect_attempts must be at least 1".to_string(),
            });
        }
        if !(self.renew_fraction > 0.0 && self.renew_fraction < 1.0) {
            return Err(HeraldError::InvalidConfig {
                reason: format!("renew_fraction must be in (0, 1), got {}", self.renew_fraction),
            });
        }
        if self.default_duration.is_zero() {
            return Err(HeraldError::InvalidConfig {
                reason: "default_duration must be non-zero".to_string(),
            });
        }
        Ok(self)
    }
}

/// Lifecycle of one producer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not yet started.
    Disconnected,
    /// Registering with the producer.
    Connecting,
    /// Holding a valid grant, waiting for the next renewal.
    Connected,
    /// Renewal call in flight.
    Renewing,
    /// Terminal: failed unrecoverably or dropped.
    Abandoned,
}

/// Identifies a connection: which producer, which event type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    #[allow(missing_docs)]
    pub producer: ProducerId,
    #[allow(missing_docs)]
    pub type_code: u64,
}

struct Connection {
    key: ConnectionKey,
    producer: SharedProducer,
    descriptor: EventDescriptor,
    state: Mutex<ConnectionState>,
    grant: Mutex<Option<Grant>>,
    stopped: AtomicBool,
    // Dropping the sender wakes every sleeper at once and keeps them awake.
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    fn new(producer: SharedProducer, descriptor: EventDescriptor) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        Self {
            key: ConnectionKey {
                producer: producer.id(),
                type_code: descriptor.type_code,
            },
            producer,
            descriptor,
            state: Mutex::new(ConnectionState::Disconnected),
            grant: Mutex::new(None),
            stopped: AtomicBool::new(false),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            join: Mutex::new(None),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        if *current != ConnectionState::Abandoned {
            *current = state;
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Sleep for `d`, or until stopped. Returns true if stopped.
    fn sleep(&self, d: Duration) -> bool {
        match self.stop_rx.recv_timeout(d) {
            Err(RecvTimeoutError::Timeout) => self.is_stopped(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    /// Block until stopped.
    fn park(&self) {
        let _ = self.stop_rx.recv();
    }

    /// Signal termination. Idempotent.
    fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.stop_tx.lock().take();
        *self.state.lock() = ConnectionState::Abandoned;
        true
    }
}

struct Shared {
    config: ClientConfig,
    consumer: SharedTarget,
    clock: SharedClock,
}

/// Connects a consumer to any number of producers.
///
/// Every connection forwards into the single consumer target handed to
/// [`SubscriptionClient::new`]; the consumer cannot tell how many producers it
/// is attached to.
pub struct SubscriptionClient {
    shared: Arc<Shared>,
    connections: DashMap<ConnectionKey, Arc<Connection>>,
}

impl fmt::Debug for SubscriptionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionClient")
            .field("config", &self.shared.config)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl SubscriptionClient {
    /// Create a client delivering into `consumer`.
    ///
    /// # Errors
    /// `InvalidConfig` if the configuration does not validate.
    pub fn new(config: ClientConfig, consumer: SharedTarget) -> HeraldResult<Self> {
        Self::with_clock(config, consumer, system_clock())
    }

    /// Same as [`SubscriptionClient::new`] with an explicit clock.
    ///
    /// # Errors
    /// `InvalidConfig` if the configuration does not validate.
    pub fn with_clock(config: ClientConfig, consumer: SharedTarget, clock: SharedClock) -> HeraldResult<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                config: config.validate()?,
                consumer,
                clock,
            }),
            connections: DashMap::new(),
        })
    }

    /// Connect to `producer` for events matching `descriptor`.
    ///
    /// Runs the bounded retry loop on the calling thread; on success a renewal
    /// thread takes over. Connecting twice to the same producer and type is a
    /// no-op while the first connection is alive.
    ///
    /// # Errors
    /// The last failure once attempts are exhausted, or the first
    /// unrecoverable one.
    pub fn connect(&self, producer: SharedProducer, descriptor: &EventDescriptor) -> HeraldResult<Grant> {
        let conn = Arc::new(Connection::new(producer, descriptor.clone()));
        if let Some(existing) = self.connections.get(&conn.key) {
            if existing.state() != ConnectionState::Abandoned {
                if let Some(grant) = *existing.grant.lock() {
                    return Ok(grant);
                }
            }
        }

        let grant = establish(&self.shared, &conn)?;
        info!(producer = %conn.key.producer, descriptor = %conn.descriptor, token = %grant.token, "connected");

        if let Some(previous) = self.connections.insert(conn.key.clone(), Arc::clone(&conn)) {
            shutdown(&previous);
        }

        let shared = Arc::clone(&self.shared);
        let worker = Arc::clone(&conn);
        let handle = thread::Builder::new()
            .name("herald-renew".to_string())
            .spawn(move || renewal_loop(&shared, &worker))
            .map_err(|e| HeraldError::internal(format!("failed to spawn renewal thread: {e}")))?;
        *conn.join.lock() = Some(handle);

        Ok(grant)
    }

    /// Drop every connection to `producer`. Idempotent.
    pub fn disconnect(&self, producer: &ProducerId) -> usize {
        let keys: Vec<ConnectionKey> = self
            .connections
            .iter()
            .filter(|c| &c.key().producer == producer)
            .map(|c| c.key().clone())
            .collect();

        keys.iter()
            .filter_map(|k| self.connections.remove(k))
            .map(|(_, conn)| shutdown(&conn))
            .count()
    }

    /// Drop every connection. Idempotent.
    pub fn drop_all(&self) {
        let keys: Vec<ConnectionKey> = self.connections.iter().map(|c| c.key().clone()).collect();
        for key in keys {
            if let Some((_, conn)) = self.connections.remove(&key) {
                shutdown(&conn);
            }
        }
    }

    /// State of a connection, if known.
    #[must_use]
    pub fn state(&self, producer: &ProducerId, type_code: u64) -> Option<ConnectionState> {
        let key = ConnectionKey {
            producer: producer.clone(),
            type_code,
        };
        self.connections.get(&key).map(|c| c.state())
    }

    /// Current grant of a connection.
    #[must_use]
    pub fn grant(&self, producer: &ProducerId, type_code: u64) -> Option<Grant> {
        let key = ConnectionKey {
            producer: producer.clone(),
            type_code,
        };
        self.connections.get(&key).and_then(|c| *c.grant.lock())
    }

    /// Keys of every tracked connection, abandoned ones included.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionKey> {
        let mut keys: Vec<ConnectionKey> = self.connections.iter().map(|c| c.key().clone()).collect();
        keys.sort();
        keys
    }
}

impl Drop for SubscriptionClient {
    fn drop(&mut self) {
        self.drop_all();
    }
}

/// Stop a connection, cancel its grant best-effort and join its thread.
fn shutdown(conn: &Arc<Connection>) {
    if !conn.stop() {
        return;
    }
    if let Some(grant) = conn.grant.lock().take() {
        if let Err(e) = conn.producer.cancel(grant.token) {
            debug!(producer = %conn.key.producer, error = %e, "cancel on disconnect failed");
        }
    }
    if let Some(handle) = conn.join.lock().take() {
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
    info!(producer = %conn.key.producer, type_code = conn.key.type_code, "connection dropped");
}

/// The bounded connect-retry loop.
fn establish(shared: &Shared, conn: &Connection) -> HeraldResult<Grant> {
    let cfg = &shared.config;
    let mut last_err = HeraldError::internal("no connect attempt made");

    for attempt in 1..=cfg.connect_attempts {
        if conn.is_stopped() {
            return Err(HeraldError::disconnected("subscription_client"));
        }
        conn.set_state(ConnectionState::Connecting);

        match conn.producer.subscribe(
            &conn.descriptor,
            Arc::clone(&shared.consumer),
            cfg.handback.clone(),
            cfg.default_duration,
        ) {
            Ok(sub) => {
                if is_positive(&sub.grant, &shared.clock) {
                    *conn.grant.lock() = Some(sub.grant);
                    // A shutdown that ran while subscribe was in flight found no
                    // grant to cancel.
                    if conn.is_stopped() {
                        if let Some(grant) = conn.grant.lock().take() {
                            let _ = conn.producer.cancel(grant.token);
                        }
                        return Err(HeraldError::disconnected("subscription_client"));
                    }
                    conn.set_state(ConnectionState::Connected);
                    return Ok(sub.grant);
                }
                warn!(producer = %conn.key.producer, attempt, "producer granted a non-positive duration");
                let _ = conn.producer.cancel(sub.grant.token);
                last_err = HeraldError::Protocol {
                    message: "granted duration is not positive".to_string(),
                };
            }
            Err(e) if e.is_unrecoverable() => {
                warn!(producer = %conn.key.producer, attempt, error = %e, "connect failed unrecoverably");
                return Err(e);
            }
            Err(e) => {
                debug!(producer = %conn.key.producer, attempt, error = %e, "connect attempt failed");
                last_err = e;
            }
        }

        if attempt < cfg.connect_attempts && conn.sleep(cfg.retry_wait) {
            return Err(HeraldError::disconnected("subscription_client"));
        }
    }

    warn!(producer = %conn.key.producer, attempts = cfg.connect_attempts, error = %last_err, "connect attempts exhausted");
    Err(last_err)
}

fn is_positive(grant: &Grant, clock: &SharedClock) -> bool {
    match grant.duration(clock.now()) {
        GrantDuration::Finite(d) => !d.is_zero(),
        GrantDuration::Unbounded => true,
    }
}

/// How long to wait before renewing, `None` for grants that never expire.
fn renew_delay(grant: &Grant, shared: &Shared) -> Option<Duration> {
    match grant.duration(shared.clock.now()) {
        GrantDuration::Finite(d) => Some(d.mul_f64(shared.config.renew_fraction).max(Duration::from_millis(1))),
        GrantDuration::Unbounded => None,
    }
}

fn renewal_loop(shared: &Shared, conn: &Connection) {
    let cfg = &shared.config;
    let mut needs_connect = false;

    while !conn.is_stopped() {
        if needs_connect {
            match establish(shared, conn) {
                Ok(grant) => {
                    info!(producer = %conn.key.producer, token = %grant.token, "reconnected");
                    needs_connect = false;
                }
                Err(e) if e.is_unrecoverable() => {
                    warn!(producer = %conn.key.producer, error = %e, "reconnect failed unrecoverably; abandoning");
                    break;
                }
                Err(_) => {
                    if conn.sleep(cfg.retry_wait) {
                        break;
                    }
                    continue;
                }
            }
        }

        let Some(grant) = *conn.grant.lock() else {
            needs_connect = true;
            continue;
        };

        match renew_delay(&grant, shared) {
            Some(wait) => {
                if conn.sleep(wait) {
                    break;
                }
            }
            None => {
                conn.park();
                break;
            }
        }

        conn.set_state(ConnectionState::Renewing);
        match conn.producer.renew(grant.token, cfg.default_duration) {
            Ok(expiration) => {
                *conn.grant.lock() = Some(Grant {
                    token: grant.token,
                    expiration,
                });
                conn.set_state(ConnectionState::Connected);
                debug!(producer = %conn.key.producer, token = %grant.token, "grant renewed");
            }
            Err(e) if e.is_unrecoverable() => {
                warn!(producer = %conn.key.producer, error = %e, "renewal failed unrecoverably; abandoning");
                break;
            }
            Err(e) => {
                warn!(producer = %conn.key.producer, error = %e, "renewal failed; re-registering");
                conn.grant.lock().take();
                needs_connect = true;
            }
        }
    }

    *conn.state.lock() = ConnectionState::Abandoned;
}
