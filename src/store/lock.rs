//! Exclusive ownership of a data directory.
//!
//! A collector writes its record files without coordination, so two
//! processes pointing at the same directory would interleave deletes and
//! rewrites. The first one to open a directory takes a non-blocking lock on
//! `<dir>/.lock`; later opens fail with [`StorageError::Locked`] until the
//! holder is dropped.

use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};

use crate::error::StorageError;

/// Name of the lock file inside a data directory.
pub const LOCK_FILE: &str = ".lock";

/// Held for as long as the directory is owned; released when dropped.
#[derive(Debug)]
pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Try to take the lock on `dir`.
    ///
    /// # Errors
    /// `Locked` if another owner holds it, `Io` for anything else.
    pub fn acquire(dir: &Path) -> Result<Self, StorageError> {
        let path = dir.join(LOCK_FILE);
        let io = |source| StorageError::Io {
            path: path.display().to_string(),
            source,
        };

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io)?;

        match Self::try_lock(&file) {
            Ok(()) => Ok(Self { _file: file, path }),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(StorageError::Locked {
                path: dir.display().to_string(),
            }),
            Err(e) => Err(io(e)),
        }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> IoResult<()> {
        use std::os::unix::io::AsRawFd;

        let fd = file.as_raw_fd();
        // SAFETY: `fd` is a valid descriptor owned by `file` for the duration of the call.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let errno = IoError::last_os_error();
            if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(IoError::new(ErrorKind::WouldBlock, "data directory is locked"));
            }
            return Err(errno);
        }
        Ok(())
    }

    #[cfg(windows)]
    fn try_lock(file: &File) -> IoResult<()> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
        };

        let handle = file.as_raw_handle() as HANDLE;
        // SAFETY: `handle` belongs to `file`; the OVERLAPPED is zeroed and outlives the call.
        let result = unsafe {
            let mut overlapped = std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>();
            LockFileEx(
                handle,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                1,
                0,
                &mut overlapped,
            )
        };

        if result == 0 {
            let err = IoError::last_os_error();
            return Err(IoError::new(
                ErrorKind::WouldBlock,
                format!("data directory is locked: {err}"),
            ));
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File) -> IoResult<()> {
        Err(IoError::new(
            ErrorKind::Unsupported,
            "directory locking not supported on this platform",
        ))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        {
            let lock = DirLock::acquire(dir.path()).unwrap();
            assert!(lock.path().exists());
        }
        DirLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn test_second_owner_is_refused() {
        let dir = tempdir().unwrap();
        let _held = DirLock::acquire(dir.path()).unwrap();

        let err = DirLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(err, StorageError::Locked { .. }));
    }
}
