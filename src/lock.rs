//! Numbered resource slots guarded by advisory file locks.
//!
//! A slot is a small integer (a database index, a port offset, ...) that at
//! most one build may hold at a time on a host. Holders are usually separate
//! processes, so exclusion is enforced by the operating system through
//! `flock`-style locks on one file per `(kind, slot)`:
//!
//! ```text
//! <lock_dir>/drover-db-0.lock   "4711\n<build id>\n"   locked by pid 4711
//! <lock_dir>/drover-db-1.lock   "4802\n<build id>\n"   locked by pid 4802
//! ```
//!
//! Acquisition probes slot 0, 1, 2, ... with a non-blocking exclusive lock
//! and keeps the first one it gets. Release unlinks the file before
//! unlocking it, and acquisition re-checks that the locked file is still the
//! one linked at the path, so a slot can never be handed out twice.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::job::BuildId;

/// Default directory for lock files.
pub const DEFAULT_LOCK_DIR: &str = "/var/tmp";

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Every slot below the caller's maximum is held.
    #[error("No free {kind} slot for build {build_id} (all {limit} slots are held)")]
    ResourceExhausted {
        kind: String,
        build_id: BuildId,
        limit: usize,
    },

    /// The slot is not held by this manager for the given build.
    #[error("Slot {slot} of {kind} is not held for build {build_id}")]
    NotHeld {
        kind: String,
        build_id: BuildId,
        slot: usize,
    },

    #[error("IO error on lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

type SlotKey = (String, usize);

/// Grants and releases numbered resource slots.
///
/// Held slots keep their open, locked file in the manager; dropping the
/// manager releases the OS locks (but leaves the files behind).
#[derive(Debug)]
pub struct LockManager {
    dir: PathBuf,
    held: Mutex<HashMap<SlotKey, (BuildId, File)>>,
}

impl LockManager {
    /// Creates a manager storing lock files in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the lock file for one slot.
    pub fn lock_path(&self, kind: &str, slot: usize) -> PathBuf {
        self.dir.join(format!("drover-{}-{}.lock", kind, slot))
    }

    /// Acquires the lowest free slot of `kind`, with no upper bound.
    pub fn acquire(&self, kind: &str, build_id: &BuildId) -> LockResult<usize> {
        self.acquire_bounded(kind, build_id, None)
    }

    /// Acquires the lowest free slot of `kind` below `max_slots`.
    ///
    /// # Errors
    ///
    /// - `LockError::ResourceExhausted` - all `max_slots` slots are held
    /// - `LockError::Io` - the lock directory or a lock file is unusable
    pub fn acquire_bounded(
        &self,
        kind: &str,
        build_id: &BuildId,
        max_slots: Option<usize>,
    ) -> LockResult<usize> {
        std::fs::create_dir_all(&self.dir).map_err(|source| LockError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut slot = 0;
        while max_slots.is_none_or(|max| slot < max) {
            let path = self.lock_path(kind, slot);
            match try_lock(&path).map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })? {
                Probe::Acquired(mut file) => {
                    write_holder(&mut file, build_id).map_err(|source| LockError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    debug!("Acquired {} slot {} for build {}", kind, slot, build_id);
                    self.held_map()
                        .insert((kind.to_string(), slot), (build_id.clone(), file));
                    return Ok(slot);
                }
                // Raced with a release that unlinked the file; probe it again.
                Probe::Stale => continue,
                Probe::Contended => slot += 1,
            }
        }

        Err(LockError::ResourceExhausted {
            kind: kind.to_string(),
            build_id: build_id.clone(),
            limit: slot,
        })
    }

    /// Releases a slot previously returned by [`acquire`](Self::acquire).
    ///
    /// The slot becomes immediately acquirable again.
    pub fn release(&self, kind: &str, build_id: &BuildId, slot: usize) -> LockResult<()> {
        let key = (kind.to_string(), slot);
        let mut held = self.held_map();
        let file = match held.remove(&key) {
            Some((holder, file)) if &holder == build_id => file,
            Some(entry) => {
                held.insert(key, entry);
                return Err(LockError::NotHeld {
                    kind: kind.to_string(),
                    build_id: build_id.clone(),
                    slot,
                });
            }
            None => {
                return Err(LockError::NotHeld {
                    kind: kind.to_string(),
                    build_id: build_id.clone(),
                    slot,
                });
            }
        };
        drop(held);

        let path = self.lock_path(kind, slot);
        let removed = std::fs::remove_file(&path);
        let unlocked = FileExt::unlock(&file);
        drop(file);
        debug!("Released {} slot {} for build {}", kind, slot, build_id);

        match removed.and(unlocked) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    /// Acquires a slot wrapped in a guard that releases it on drop.
    pub fn lease(
        self: &Arc<Self>,
        kind: &str,
        build_id: &BuildId,
        max_slots: Option<usize>,
    ) -> LockResult<SlotLease> {
        let slot = self.acquire_bounded(kind, build_id, max_slots)?;
        Ok(SlotLease {
            manager: Arc::clone(self),
            kind: kind.to_string(),
            build_id: build_id.clone(),
            slot,
            released: false,
        })
    }

    /// Number of slots currently held through this manager.
    pub fn held_count(&self) -> usize {
        self.held_map().len()
    }

    fn held_map(&self) -> std::sync::MutexGuard<'_, HashMap<SlotKey, (BuildId, File)>> {
        // The map holds no invariants a panicking holder could break.
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A held slot, released when dropped.
#[derive(Debug)]
pub struct SlotLease {
    manager: Arc<LockManager>,
    kind: String,
    build_id: BuildId,
    slot: usize,
    released: bool,
}

impl SlotLease {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Releases the slot now, reporting any error.
    pub fn release(mut self) -> LockResult<()> {
        self.released = true;
        self.manager.release(&self.kind, &self.build_id, self.slot)
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if !self.released
            && let Err(e) = self.manager.release(&self.kind, &self.build_id, self.slot)
        {
            warn!("Failed to release {} slot {}: {}", self.kind, self.slot, e);
        }
    }
}

enum Probe {
    Acquired(File),
    Contended,
    Stale,
}

fn try_lock(path: &Path) -> std::io::Result<Probe> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?;

    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => return Ok(Probe::Contended),
        Err(e) => return Err(e),
    }

    if still_linked(&file, path)? {
        Ok(Probe::Acquired(file))
    } else {
        Ok(Probe::Stale)
    }
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let locked = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(locked.dev() == current.dev() && locked.ino() == current.ino()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> std::io::Result<bool> {
    Ok(path.exists())
}

fn write_holder(file: &mut File, build_id: &BuildId) -> std::io::Result<()> {
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    writeln!(file, "{}", build_id)?;
    file.flush()
}
