//! Durable backing for the event store.
//!
//! The store calls into an [`EventJournal`] for every in-memory mutation.
//! [`FileJournal`] keeps one record file per event and does its writes on a
//! dedicated `herald-writer` thread so `append` never waits on the disk.
//! Removals travel through the same queue and are acknowledged, which orders
//! them after any pending write of the same event.

use std::fmt;
#[cfg(feature = "persistent")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "persistent")]
use std::sync::Arc;
#[cfg(feature = "persistent")]
use std::thread::{self, JoinHandle};

#[cfg(feature = "persistent")]
use crossbeam_channel::{bounded, unbounded, Sender};
#[cfg(feature = "persistent")]
use parking_lot::Mutex;
#[cfg(feature = "persistent")]
use tracing::{debug, error};

use crate::error::StorageError;
use crate::event::Event;

#[cfg(feature = "persistent")]
use super::records::RecordDir;

/// Persistence hooks for [`EventStore`](super::EventStore).
pub trait EventJournal: Send + Sync + fmt::Debug {
    /// Everything previously recorded, in any order.
    ///
    /// # Errors
    /// If the backing medium cannot be read at all. Individual unreadable
    /// records are skipped rather than failing the load.
    fn load(&self) -> Result<Vec<Event>, StorageError>;

    /// Record a newly stored event. May return before the write is durable.
    ///
    /// # Errors
    /// If the event cannot be queued.
    fn record(&self, event: &Event) -> Result<(), StorageError>;

    /// Forget a deleted event. Returns once the removal has happened.
    ///
    /// # Errors
    /// If the backing record cannot be removed.
    fn forget(&self, event: &Event) -> Result<(), StorageError>;

    /// Wait until every prior `record` is durable.
    ///
    /// # Errors
    /// If the writer is gone.
    fn flush(&self) -> Result<(), StorageError>;
}

/// File name for an event record: sequence, a digest of the type identifier,
/// and the timestamp, so the name alone identifies the event.
#[cfg(feature = "persistent")]
#[must_use]
pub fn record_name(event: &Event) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(event.kind.as_bytes());
    hasher.update(&event.type_code.to_le_bytes());
    let digest = hasher.finalize().to_hex();
    let stamp = event.timestamp.timestamp_nanos_opt().map_or_else(
        || event.timestamp.format("%Y%m%dT%H%M%S%.9fZ").to_string(),
        |nanos| nanos.to_string(),
    );
    format!("evt-{:020}-{}-{stamp}.rec", event.sequence, &digest[..16])
}

#[cfg(feature = "persistent")]
enum WriterCommand {
    Write(Box<Event>),
    Remove {
        name: String,
        reply: Sender<Result<(), StorageError>>,
    },
    Flush {
        reply: Sender<()>,
    },
}

/// Record-per-event journal with an asynchronous writer thread.
#[cfg(feature = "persistent")]
pub struct FileJournal {
    records: RecordDir,
    tx: Mutex<Option<Sender<WriterCommand>>>,
    join: Mutex<Option<JoinHandle<()>>>,
    write_failures: Arc<AtomicU64>,
}

#[cfg(feature = "persistent")]
impl fmt::Debug for FileJournal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileJournal")
            .field("root", &self.records.root())
            .field("write_failures", &self.write_failures())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "persistent")]
impl FileJournal {
    /// Start the writer thread over `records`.
    ///
    /// # Errors
    /// `Io` if the thread cannot be spawned.
    pub fn start(records: RecordDir) -> Result<Self, StorageError> {
        let (tx, rx) = unbounded::<WriterCommand>();
        let write_failures = Arc::new(AtomicU64::new(0));

        let dir = records.clone();
        let failures = Arc::clone(&write_failures);
        let join = thread::Builder::new()
            .name("herald-writer".to_string())
            .spawn(move || {
                for command in rx {
                    match command {
                        WriterCommand::Write(event) => {
                            let name = record_name(&event);
                            if let Err(e) = dir.write(&name, &*event) {
                                failures.fetch_add(1, Ordering::Relaxed);
                                error!(record = %name, error = %e, "failed to persist event");
                            }
                        }
                        WriterCommand::Remove { name, reply } => {
                            let result = dir.remove(&name).map(|_| ());
                            let _ = reply.send(result);
                        }
                        WriterCommand::Flush { reply } => {
                            let _ = reply.send(());
                        }
                    }
                }
                debug!("event writer exiting");
            })
            .map_err(|e| StorageError::Io {
                path: records.root().display().to_string(),
                source: e,
            })?;

        Ok(Self {
            records,
            tx: Mutex::new(Some(tx)),
            join: Mutex::new(Some(join)),
            write_failures,
        })
    }

    /// Number of event writes that failed since start.
    #[must_use]
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    fn send(&self, command: WriterCommand) -> Result<(), StorageError> {
        let tx = self.tx.lock();
        let sender = tx.as_ref().ok_or_else(|| writer_gone(&self.records))?;
        sender.send(command).map_err(|_| writer_gone(&self.records))
    }

    /// Drain the queue and stop the writer. Idempotent.
    pub fn close(&self) {
        self.tx.lock().take();
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(feature = "persistent")]
fn writer_gone(records: &RecordDir) -> StorageError {
    StorageError::Io {
        path: records.root().display().to_string(),
        source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "event writer stopped"),
    }
}

#[cfg(feature = "persistent")]
impl EventJournal for FileJournal {
    fn load(&self) -> Result<Vec<Event>, StorageError> {
        Ok(self
            .records
            .load_all::<Event>("evt-")?
            .into_iter()
            .map(|(_, event)| event)
            .collect())
    }

    fn record(&self, event: &Event) -> Result<(), StorageError> {
        self.send(WriterCommand::Write(Box::new(event.clone())))
    }

    fn forget(&self, event: &Event) -> Result<(), StorageError> {
        let (reply, done) = bounded(1);
        self.send(WriterCommand::Remove {
            name: record_name(event),
            reply,
        })?;
        done.recv().map_err(|_| writer_gone(&self.records))?
    }

    fn flush(&self) -> Result<(), StorageError> {
        let (reply, done) = bounded(1);
        self.send(WriterCommand::Flush { reply })?;
        done.recv().map_err(|_| writer_gone(&self.records))
    }
}

#[cfg(feature = "persistent")]
impl Drop for FileJournal {
    fn drop(&mut self) {
        self.close();
    }
}
