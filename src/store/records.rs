//! One-record-per-file persistence.
//!
//! Each record lives in its own file named after the thing it describes, so a
//! delete is a single unlink and a reload is a directory scan. Writes go to a
//! temporary sibling first and are renamed into place after an fsync; a crash
//! leaves either the old record, the new one, or a stray temp file that the
//! next scan sweeps.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StorageError;

use super::codec;
use super::lock::DirLock;

/// Extension carried by every committed record.
pub const RECORD_EXT: &str = "rec";

const TEMP_MARKER: &str = ".tmp.";

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// A directory of codec-framed record files.
#[derive(Debug, Clone)]
pub struct RecordDir {
    root: PathBuf,
    sync: bool,
}

impl RecordDir {
    /// Open (creating if needed) a record directory.
    ///
    /// # Errors
    /// `Io` if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>, sync: bool) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        Ok(Self { root, sync })
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Atomically replace the record `name` with `value`.
    ///
    /// # Errors
    /// `Codec` if `value` cannot be serialized, `Io` on any file failure. The
    /// temp file is removed on failure.
    pub fn write<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StorageError> {
        let final_path = self.path_of(name);
        let temp_path = self.path_of(&format!("{name}{TEMP_MARKER}{}", Uuid::new_v4().simple()));

        let result = self.write_temp(&temp_path, value).and_then(|()| {
            fs::rename(&temp_path, &final_path).map_err(|e| io_err(&final_path, e))
        });
        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result
    }

    fn write_temp<T: Serialize>(&self, temp_path: &Path, value: &T) -> Result<(), StorageError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp_path)
            .map_err(|e| io_err(temp_path, e))?;

        let mut writer = BufWriter::new(file);
        codec::write_record(&mut writer, value)?;
        writer.flush().map_err(|e| io_err(temp_path, e))?;
        if self.sync {
            writer.get_ref().sync_all().map_err(|e| io_err(temp_path, e))?;
        }
        Ok(())
    }

    /// Read and verify the record `name`.
    ///
    /// # Errors
    /// `Io` if the file cannot be opened, `Codec` if it fails verification.
    pub fn read<T: DeserializeOwned>(&self, name: &str) -> Result<T, StorageError> {
        let path = self.path_of(name);
        let file = File::open(&path).map_err(|e| io_err(&path, e))?;
        codec::read_record(&mut BufReader::new(file))
    }

    /// Remove the record `name`. Returns false if it was not there.
    ///
    /// # Errors
    /// `Io` for any failure other than the file being absent.
    pub fn remove(&self, name: &str) -> Result<bool, StorageError> {
        let path = self.path_of(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    /// Names of committed records starting with `prefix`, sorted. Leftover
    /// temp files are deleted along the way.
    ///
    /// # Errors
    /// `Io` if the directory cannot be listed.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let entries = fs::read_dir(&self.root).map_err(|e| io_err(&self.root, e))?;
        let suffix = format!(".{RECORD_EXT}");

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&self.root, e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !name.starts_with(prefix) {
                continue;
            }
            if name.contains(TEMP_MARKER) {
                debug!(record = %name, "removing abandoned temp record");
                let _ = fs::remove_file(entry.path());
                continue;
            }
            if name.ends_with(&suffix) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load every readable record starting with `prefix`. Records that fail
    /// verification are logged and skipped.
    ///
    /// # Errors
    /// `Io` if the directory cannot be listed.
    pub fn load_all<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, T)>, StorageError> {
        let mut out = Vec::new();
        for name in self.list(prefix)? {
            match self.read(&name) {
                Ok(value) => out.push((name, value)),
                Err(e) => warn!(record = %name, error = %e, "skipping unreadable record"),
            }
        }
        Ok(out)
    }
}

/// Layout of a collector data directory:
///
/// ```text
/// <root>/.lock
/// <root>/events/evt-*.rec
/// <root>/registrations/reg-*.rec
/// ```
#[derive(Debug)]
pub struct DataDir {
    _lock: DirLock,
    events: RecordDir,
    registrations: RecordDir,
}

impl DataDir {
    /// Create the layout under `root` and take ownership of it.
    ///
    /// # Errors
    /// `Locked` if another owner holds the directory, `Io` otherwise.
    pub fn open(root: &Path, sync: bool) -> Result<Self, StorageError> {
        fs::create_dir_all(root).map_err(|e| io_err(root, e))?;
        let lock = DirLock::acquire(root)?;
        Ok(Self {
            _lock: lock,
            events: RecordDir::open(root.join("events"), sync)?,
            registrations: RecordDir::open(root.join("registrations"), sync)?,
        })
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn events(&self) -> &RecordDir {
        &self.events
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn registrations(&self) -> &RecordDir {
        &self.registrations
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_write_replaces_atomically() {
        let dir = tempdir().unwrap();
        let records = RecordDir::open(dir.path(), true).unwrap();

        records.write("a-1.rec", &"first").unwrap();
        records.write("a-1.rec", &"second").unwrap();

        assert_eq!(records.read::<String>("a-1.rec").unwrap(), "second");
        assert_eq!(records.list("a-").unwrap(), vec!["a-1.rec".to_string()]);
    }

    #[test]
    fn test_remove_missing_is_not_an_error() {
        let dir = tempdir().unwrap();
        let records = RecordDir::open(dir.path(), false).unwrap();
        records.write("a-1.rec", &1u32).unwrap();

        assert!(records.remove("a-1.rec").unwrap());
        assert!(!records.remove("a-1.rec").unwrap());
    }

    #[test]
    fn test_list_sweeps_temp_files() {
        let dir = tempdir().unwrap();
        let records = RecordDir::open(dir.path(), false).unwrap();
        fs::write(dir.path().join("a-2.rec.tmp.deadbeef"), b"partial").unwrap();
        records.write("a-1.rec", &1u32).unwrap();

        assert_eq!(records.list("a-").unwrap().len(), 1);
        assert!(!dir.path().join("a-2.rec.tmp.deadbeef").exists());
    }

    #[test]
    fn test_load_all_skips_corrupt_records() {
        let dir = tempdir().unwrap();
        let records = RecordDir::open(dir.path(), false).unwrap();
        records.write("a-1.rec", &10u32).unwrap();
        records.write("a-2.rec", &20u32).unwrap();
        fs::write(dir.path().join("a-3.rec"), b"not a record").unwrap();

        let loaded: Vec<(String, u32)> = records.load_all("a-").unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1], ("a-2.rec".to_string(), 20));
    }

    #[test]
    fn test_data_dir_is_exclusive() {
        let dir = tempdir().unwrap();
        let data = DataDir::open(dir.path(), false).unwrap();
        assert!(data.events().root().ends_with("events"));

        let err = DataDir::open(dir.path(), false).unwrap_err();
        assert!(matches!(err, StorageError::Locked { .. }));
    }
}
