//! Bounded thread pool for history replay.
//!
//! Each `enable_delivery` submits one job. Jobs for different registrations run
//! concurrently with each other and with ingestion.

use std::fmt;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{HeraldError, HeraldResult};

/// Unit of work run on a replay worker.
pub(crate) type ReplayJob = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct ReplayPool {
    tx: Mutex<Option<Sender<ReplayJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    queue_capacity: usize,
}

impl fmt::Debug for ReplayPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayPool")
            .field("workers", &self.workers.lock().len())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl ReplayPool {
    pub(crate) fn start(workers: usize, queue_capacity: usize) -> HeraldResult<Self> {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<ReplayJob>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<ReplayJob> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("herald-replay-{idx}"))
                .spawn(move || {
                    for job in rx {
                        job();
                    }
                })
                .map_err(|e| HeraldError::internal(format!("failed to spawn replay worker: {e}")))?;
            handles.push(handle);
        }

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            queue_capacity,
        })
    }

    pub(crate) fn try_submit(&self, job: ReplayJob) -> HeraldResult<()> {
        let tx = self.tx.lock();
        let sender = tx.as_ref().ok_or_else(|| HeraldError::disconnected("replay"))?;
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(HeraldError::QueueFull {
                path: "replay".to_string(),
                capacity: self.queue_capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(HeraldError::disconnected("replay")),
        }
    }

    /// Close the queue and wait for the workers. Jobs already queued still
    /// run; they are expected to notice shutdown and return early. Idempotent.
    pub(crate) fn shutdown(&self) {
        self.tx.lock().take();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let count = workers.len();
        for handle in workers {
            let _ = handle.join();
        }
        if count > 0 {
            debug!(workers = count, "replay pool stopped");
        }
    }
}

impl Drop for ReplayPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
