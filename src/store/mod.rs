//! Event storage.
//!
//! [`EventStore`] is the ordered, de-duplicated in-memory log. Durability is
//! layered on through an [`EventJournal`]; with the `persistent` feature,
//! [`FileJournal`] writes one checksummed record per event into a locked
//! [`DataDir`].

/// Journal trait and the file-backed writer.
pub mod journal;
/// The ordered log.
pub mod memory;

#[cfg(feature = "persistent")]
pub mod codec;
#[cfg(feature = "persistent")]
pub mod lock;
#[cfg(feature = "persistent")]
pub mod records;

pub use journal::EventJournal;
#[cfg(feature = "persistent")]
pub use journal::{record_name, FileJournal};
#[cfg(feature = "persistent")]
pub use lock::DirLock;
pub use memory::EventStore;
#[cfg(feature = "persistent")]
pub use records::{DataDir, RecordDir};

use std::path::PathBuf;

use crate::error::{HeraldError, HeraldResult};

/// Where and how a collector persists its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceConfig {
    /// Root of the data directory.
    pub data_dir: PathBuf,
    /// Fsync each record before publishing it.
    pub sync_on_write: bool,
}

impl PersistenceConfig {
    /// Persistence rooted at `data_dir`, with fsync on.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            sync_on_write: true,
        }
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// `InvalidConfig` for an empty path.
    pub fn validate(self) -> HeraldResult<Self> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(HeraldError::InvalidConfig {
                reason: "data_dir must not be empty".to_string(),
            });
        }
        Ok(self)
    }
}
