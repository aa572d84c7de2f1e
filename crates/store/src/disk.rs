//! Flat-directory content-addressed store with atime-based eviction.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Re-touch a file's atime at most this often (seconds).
const ATIME_RESOLUTION_SECS: i64 = 86_400;

/// Index record stored at `a-<actionID>`, pointing at an object file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Schema version
    #[serde(rename = "v")]
    pub version: u32,
    /// Object id as lowercase hex
    #[serde(rename = "o")]
    pub object_id: String,
    /// Declared body size in bytes
    #[serde(rename = "n")]
    pub size: u64,
    /// Write timestamp, nanoseconds since the epoch
    #[serde(rename = "t")]
    pub time_nanos: i64,
}

/// A successful index lookup.
#[derive(Debug, Clone)]
pub struct StoreHit {
    /// Object id as lowercase hex
    pub object_id: String,
    /// Full path of the object file; the caller stats it
    pub path: PathBuf,
}

/// Content-addressed store rooted at a single directory.
///
/// Safe for concurrent use across processes: object writes are atomic
/// renames over a unique name, and index writes only publish after the
/// object exists. Concurrent puts of the same key are last-writer-wins.
#[derive(Debug)]
pub struct DiskStore {
    dir: PathBuf,
    manual_atime: bool,
}

impl DiskStore {
    /// Open (creating if necessary) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::io(e, &dir, "create_dir_all"))?;
        Ok(Self {
            dir,
            manual_atime: false,
        })
    }

    /// Touch access times on every get, for filesystems mounted `noatime`.
    #[must_use]
    pub fn with_manual_atime(mut self, manual: bool) -> Self {
        self.manual_atime = manual;
        self
    }

    /// The store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn action_path(&self, action_id: &str) -> PathBuf {
        self.dir.join(format!("a-{action_id}"))
    }

    /// Path of the object file for a lowercase-hex object id, or `None`
    /// if the id is not plausible hex (guards against hostile filenames).
    #[must_use]
    pub fn object_path(&self, object_id: &str) -> Option<PathBuf> {
        if !(4..=1000).contains(&object_id.len()) {
            return None;
        }
        if !object_id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return None;
        }
        Some(self.dir.join(format!("o-{object_id}")))
    }

    /// Look up an action id.
    ///
    /// Returns `Ok(None)` on a clean miss and on a degraded entry
    /// (unparseable JSON, non-hex object id). The returned path is not
    /// statted here; the object may have been evicted since the index was
    /// written.
    pub fn get(&self, action_id: &str) -> Result<Option<StoreHit>> {
        let action_file = self.action_path(action_id);
        let raw = match fs::read(&action_file) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(action = action_id, "disk miss");
                return Ok(None);
            }
            Err(e) => return Err(Error::io(e, &action_file, "read")),
        };
        self.mark_access(&action_file);

        let entry: IndexEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(action = action_id, error = %e, "corrupt index entry, treating as miss");
                return Ok(None);
            }
        };
        if hex::decode(&entry.object_id).is_err() {
            // Protect against a malicious non-hex object id on disk.
            warn!(action = action_id, "non-hex object id in index, treating as miss");
            return Ok(None);
        }

        let object_file = self.dir.join(format!("o-{}", entry.object_id));
        self.mark_access(&object_file);
        Ok(Some(StoreHit {
            object_id: entry.object_id,
            path: object_file,
        }))
    }

    /// Store a body under `object_id` and publish the index for
    /// `action_id`. Returns the object file path.
    ///
    /// The body is copied to a temp file in the store directory, verified
    /// against `size`, and renamed into place; the index record is written
    /// the same way afterwards, so readers never observe an index without
    /// its object.
    pub fn put(
        &self,
        action_id: &str,
        object_id: &str,
        size: u64,
        body: &mut dyn Read,
    ) -> Result<PathBuf> {
        let object_file = self.dir.join(format!("o-{object_id}"));

        if size == 0 {
            // Common case, and create-or-truncate of a zero-byte file
            // needs no rename dance.
            fs::File::create(&object_file)
                .map_err(|e| Error::io(e, &object_file, "create"))?;
        } else {
            let wrote = write_atomic(&self.dir, &object_file, body)?;
            if wrote != size {
                return Err(Error::SizeMismatch {
                    wrote,
                    expected: size,
                });
            }
        }

        let entry = IndexEntry {
            version: 1,
            object_id: object_id.to_string(),
            size,
            time_nanos: unix_nanos(),
        };
        let raw = serde_json::to_vec(&entry)
            .map_err(|e| Error::serialization(format!("failed to encode index entry: {e}")))?;
        let action_file = self.action_path(action_id);
        write_atomic(&self.dir, &action_file, &mut raw.as_slice())?;

        Ok(object_file)
    }

    /// Drop the index record for an action id, if any. Used when the
    /// referenced object file has vanished from under the index.
    pub fn forget(&self, action_id: &str) -> Result<()> {
        let action_file = self.action_path(action_id);
        match fs::remove_file(&action_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(e, &action_file, "remove")),
        }
    }

    /// Unlink every direct child of the store directory whose last access
    /// is strictly older than `now - ttl`. Subdirectories are left alone,
    /// and per-entry errors are skipped. Returns the number of removed
    /// files.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        let expire = unix_secs() - ttl.as_secs() as i64;
        let mut removed = 0usize;
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                continue;
            }
            if meta.atime() < expire && fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        info!(removed, dir = %self.dir.display(), "swept object store");
        removed
    }

    /// Update a file's atime if the recorded one is older than a day.
    /// Only in manual-atime mode; failures are ignored.
    fn mark_access(&self, path: &Path) {
        if !self.manual_atime {
            return;
        }
        let Ok(meta) = fs::metadata(path) else { return };
        if unix_secs() - meta.atime() < ATIME_RESOLUTION_SECS {
            return;
        }
        let _ = filetime::set_file_atime(path, filetime::FileTime::now());
    }
}

fn unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as i64)
}

/// Copy `body` to a temp file next to `dest`, chmod 0644, and rename it
/// into place. Returns the number of bytes copied; the temp file is
/// removed on any failure.
fn write_atomic(dir: &Path, dest: &Path, body: &mut dyn Read) -> Result<u64> {
    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io(e, dir, "create temp file"))?;
    let copied = io::copy(body, tmp.as_file_mut()).map_err(|e| Error::io(e, dest, "write"))?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o644))
        .map_err(|e| Error::io(e, dest, "chmod"))?;
    tmp.persist(dest)
        .map_err(|e| Error::io(e.error, dest, "rename"))?;
    Ok(copied)
}
