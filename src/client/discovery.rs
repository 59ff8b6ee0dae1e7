use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::dispatch::{ProducerId, SharedProducer};
use crate::error::{HeraldError, HeraldResult};
use crate::event::EventDescriptor;

use super::subscription::SubscriptionClient;

/// Membership change reported by the external discovery service.
pub enum DiscoveryEvent {
    /// A producer became reachable.
    Joined(SharedProducer),
    /// A producer went away.
    Left(ProducerId),
}

impl fmt::Debug for DiscoveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Joined(p) => f.debug_tuple("Joined").field(&p.id()).finish(),
            Self::Left(id) => f.debug_tuple("Left").field(id).finish(),
        }
    }
}

/// Everything discovery needs, passed in explicitly: the client that owns the
/// connections and the template producers must match.
#[derive(Debug)]
pub struct DiscoveryContext {
    client: Arc<SubscriptionClient>,
    template: EventDescriptor,
}

impl DiscoveryContext {
    #[allow(missing_docs)]
    #[must_use]
    pub const fn new(client: Arc<SubscriptionClient>, template: EventDescriptor) -> Self {
        Self { client, template }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn client(&self) -> &Arc<SubscriptionClient> {
        &self.client
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn template(&self) -> &EventDescriptor {
        &self.template
    }

    /// React to one membership change.
    ///
    /// # Errors
    /// The connect failure for a matching producer that could not be reached.
    pub fn handle(&self, event: DiscoveryEvent) -> HeraldResult<()> {
        match event {
            DiscoveryEvent::Joined(producer) => {
                let Some(descriptor) = producer
                    .descriptors()
                    .into_iter()
                    .find(|d| d.matches(&self.template))
                else {
                    debug!(producer = %producer.id(), template = %self.template, "producer does not match template");
                    return Ok(());
                };
                self.client.connect(producer, &descriptor).map(|_| ())
            }
            DiscoveryEvent::Left(id) => {
                let dropped = self.client.disconnect(&id);
                info!(producer = %id, dropped, "producer left");
                Ok(())
            }
        }
    }
}

/// Drives a [`SubscriptionClient`] from a stream of membership changes on a
/// dedicated `herald-discovery` thread.
pub struct ProducerDiscovery {
    context: Arc<DiscoveryContext>,
    stop_tx: Mutex<Option<Sender<()>>>,
    join: Mutex<Option<JoinHandle<()>>>,
    terminated: AtomicBool,
}

impl fmt::Debug for ProducerDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerDiscovery")
            .field("context", &self.context)
            .field("terminated", &self.terminated.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ProducerDiscovery {
    /// Start consuming `events`.
    ///
    /// # Errors
    /// If the worker thread cannot be spawned.
    pub fn start(context: DiscoveryContext, events: Receiver<DiscoveryEvent>) -> HeraldResult<Self> {
        let context = Arc::new(context);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let worker = Arc::clone(&context);
        let join = thread::Builder::new()
            .name("herald-discovery".to_string())
            .spawn(move || worker_loop(&worker, &events, &stop_rx))
            .map_err(|e| HeraldError::internal(format!("failed to spawn discovery worker: {e}")))?;

        Ok(Self {
            context,
            stop_tx: Mutex::new(Some(stop_tx)),
            join: Mutex::new(Some(join)),
            terminated: AtomicBool::new(false),
        })
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn context(&self) -> &DiscoveryContext {
        &self.context
    }

    /// Stop the worker and drop every connection it created. Idempotent.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_tx.lock().take();
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
        self.context.client.drop_all();
    }
}

impl Drop for ProducerDiscovery {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn worker_loop(context: &DiscoveryContext, events: &Receiver<DiscoveryEvent>, stop_rx: &Receiver<()>) {
    loop {
        let next = select! {
            recv(events) -> msg => msg.ok(),
            recv(stop_rx) -> _ => None,
        };
        let Some(event) = next else {
            debug!("discovery worker exiting");
            break;
        };
        if let Err(e) = context.handle(event) {
            warn!(error = %e, "failed to act on discovery event");
        }
    }
}
