//! Crash-safe whole-file replacement.
//!
//! Protocol: write the full contents to a fresh temp file in the target
//! directory, fsync it, then rename over the target. A reader therefore
//! always sees either the previous complete file or the new complete file.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
#[cfg(any(test, feature = "testing"))]
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

use crate::error::ContextError;
use crate::Result;

const TMP_PREFIX: &str = ".ctxheap-";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Default)]
pub struct AtomicWriter {
    /// Remaining attempts that abort after fsync but before rename
    #[cfg(any(test, feature = "testing"))]
    crash_before_rename: AtomicU32,
}

impl AtomicWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `path` with `bytes`, retrying once with a new temp file
    pub fn write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Err(first) = self.try_write(path, bytes) {
            warn!(path = %path.display(), error = %first, "atomic write failed, retrying");
            return self
                .try_write(path, bytes)
                .map_err(|e| ContextError::storage(path, e));
        }
        Ok(())
    }

    fn try_write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(TMP_PREFIX)
            .suffix(TMP_SUFFIX)
            .tempfile_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;

        if self.take_crash() {
            // Leave the temp file behind the way a killed process would
            let _ = tmp.keep();
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "simulated crash before rename",
            ));
        }

        tmp.persist(path).map_err(|e| e.error)?;
        sync_dir(dir);
        Ok(())
    }

    /// Make the next `attempts` writes abort between fsync and rename
    #[cfg(any(test, feature = "testing"))]
    pub fn crash_before_rename(&self, attempts: u32) {
        self.crash_before_rename.store(attempts, Ordering::SeqCst);
    }

    #[cfg(any(test, feature = "testing"))]
    fn take_crash(&self) -> bool {
        self.crash_before_rename
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[cfg(not(any(test, feature = "testing")))]
    fn take_crash(&self) -> bool {
        false
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    // Persist the rename itself; failure here only weakens durability
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Whether a directory entry is a leftover temp file from an interrupted write
pub fn is_temp_file(name: &str) -> bool {
    name.starts_with(TMP_PREFIX) && name.ends_with(TMP_SUFFIX)
}

/// Remove temp files left by interrupted writes; returns how many were removed
pub fn sweep_temp_files(dir: &Path) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(ContextError::storage(dir, e)),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry.map_err(|e| ContextError::storage(dir, e))?;
        let name = entry.file_name();
        if is_temp_file(&name.to_string_lossy()) {
            fs::remove_file(entry.path()).map_err(|e| ContextError::storage(entry.path(), e))?;
            debug!(file = %entry.path().display(), "removed stale temp file");
            removed += 1;
        }
    }
    Ok(removed)
}
