//! Singleton lock providers.
//!
//! A provider guards the "at most one live instance" guarantee with a
//! TTL-bounded lease `{pid, time}` kept in a named backend. `check()`
//! reports a competing live lease, `set()` claims the lease only when no
//! competitor holds it, `refresh()` re-stamps an owned lease, and
//! `teardown()` releases the lease only when the stored pid is our own.
//! Providers run their gate at Init dispatch, before the service's own
//! setup.
//!
//! Three backends ship: a no-op [`NullLock`], a file-backed [`FileLock`]
//! (exclusive-locked lease file), and [`KvLock`] over a pluggable key-value
//! store with an in-process [`MemoryStore`] implementation.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::epoch_now;
use crate::config::LockConfig;
use crate::error::{Error, Result};

/// A recorded claim on the singleton lock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    /// Pid of the claiming process.
    pub pid: u32,
    /// Epoch seconds when the lease was (re)stamped.
    pub time: f64,
}

impl Lease {
    /// A fresh lease for the current process.
    #[must_use]
    pub fn mine() -> Self {
        Self {
            pid: std::process::id(),
            time: epoch_now(),
        }
    }

    /// Whether this lease is still within its TTL plus padding.
    #[must_use]
    pub fn is_live(&self, ttl: f64, padding: f64) -> bool {
        self.time + ttl + padding >= epoch_now()
    }
}

/// Polymorphic singleton-lock capability.
///
/// Implementors provide the backend primitives (`read`, `write`, `clear`)
/// and the lease bounds; the lease semantics (`check`, `set`, `refresh`,
/// `teardown`) are provided on top of them.
pub trait LockProvider: Send {
    /// Backend name for logs and error messages.
    fn name(&self) -> &str;

    /// Lease time-to-live in seconds.
    fn ttl(&self) -> f64;

    /// Grace padding added to the TTL before a lease counts as expired.
    fn padding(&self) -> f64;

    /// Read the stored lease, if any.
    ///
    /// # Errors
    ///
    /// Returns a lock error when the backend cannot be read.
    fn read(&mut self) -> Result<Option<Lease>>;

    /// Store a lease, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns a lock error when the backend cannot be written.
    fn write(&mut self, lease: &Lease) -> Result<()>;

    /// Remove the stored lease.
    ///
    /// # Errors
    ///
    /// Returns a lock error when the backend cannot be cleared.
    fn clear(&mut self) -> Result<()>;

    /// Prepare the backend. Runs before the first `set()`.
    ///
    /// # Errors
    ///
    /// Returns a lock error when the backend cannot be prepared.
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Collect environment problems; non-empty fails startup.
    fn check_environment(&self) -> Vec<String> {
        Vec::new()
    }

    /// The competing lease, if a different process holds one that has not
    /// expired.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    fn check(&mut self) -> Result<Option<Lease>> {
        let me = std::process::id();
        let (ttl, padding) = (self.ttl(), self.padding());
        Ok(self
            .read()?
            .filter(|lease| lease.pid != me && lease.is_live(ttl, padding)))
    }

    /// Claim the lease. Fails when a competitor holds a live lease.
    ///
    /// # Errors
    ///
    /// Returns a lock-held error naming the competing pid, or propagates a
    /// backend failure.
    fn set(&mut self) -> Result<()> {
        if let Some(holder) = self.check()? {
            return Err(Error::lock_held(
                format!(
                    "singleton lease '{}' is held by pid {}",
                    self.name(),
                    holder.pid
                ),
                holder.pid,
            ));
        }
        self.write(&Lease::mine())
    }

    /// Re-stamp the owned lease so it stays within its TTL.
    ///
    /// # Errors
    ///
    /// Propagates backend write failures.
    fn refresh(&mut self) -> Result<()> {
        self.write(&Lease::mine())
    }

    /// Release the lease iff the stored pid is our own.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    fn teardown(&mut self) -> Result<()> {
        if let Some(lease) = self.read()? {
            if lease.pid == std::process::id() {
                self.clear()?;
                debug!(backend = self.name(), "lease released");
            }
        }
        Ok(())
    }
}

/// No-op provider: every operation succeeds, no lease is ever visible.
#[derive(Debug, Default)]
pub struct NullLock;

impl LockProvider for NullLock {
    fn name(&self) -> &str {
        "null"
    }

    fn ttl(&self) -> f64 {
        0.0
    }

    fn padding(&self) -> f64 {
        0.0
    }

    fn read(&mut self) -> Result<Option<Lease>> {
        Ok(None)
    }

    fn write(&mut self, _lease: &Lease) -> Result<()> {
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        Ok(())
    }
}

/// File-backed provider: the lease is a JSON body in an exclusive-locked
/// file. A live-looking lease whose pid no longer exists is reported
/// expired early.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    ttl: f64,
    padding: f64,
}

impl FileLock {
    /// Create a provider around a lease file path.
    pub fn new<P: AsRef<Path>>(path: P, ttl: f64, padding: f64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ttl,
            padding,
        }
    }

    /// Create a provider from the lock section of the configuration.
    /// Returns `None` when no lease path is configured.
    #[must_use]
    pub fn from_config(config: &LockConfig) -> Option<Self> {
        config
            .path
            .as_ref()
            .map(|path| Self::new(path, config.ttl_secs, config.padding_secs))
    }

    fn open_locked(&self, create: bool) -> Result<Option<File>> {
        let open = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&self.path);
        let file = match open {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::lock(format!(
                    "failed to open lease file {}: {e}",
                    self.path.display()
                )))
            }
        };
        file.lock_exclusive().map_err(|e| {
            Error::lock(format!(
                "failed to lock lease file {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(Some(file))
    }
}

impl LockProvider for FileLock {
    fn name(&self) -> &str {
        "file"
    }

    fn ttl(&self) -> f64 {
        self.ttl
    }

    fn padding(&self) -> f64 {
        self.padding
    }

    fn read(&mut self) -> Result<Option<Lease>> {
        let Some(mut file) = self.open_locked(false)? else {
            return Ok(None);
        };
        let mut body = String::new();
        file.read_to_string(&mut body)
            .map_err(|e| Error::lock(format!("failed to read lease file: {e}")))?;
        let _ = FileExt::unlock(&file);
        if body.trim().is_empty() {
            return Ok(None);
        }
        match serde_json::from_str(&body) {
            Ok(lease) => Ok(Some(lease)),
            Err(e) => {
                // A corrupt lease must not wedge the daemon forever.
                warn!(path = %self.path.display(), error = %e, "discarding unreadable lease");
                Ok(None)
            }
        }
    }

    fn write(&mut self, lease: &Lease) -> Result<()> {
        let Some(mut file) = self.open_locked(true)? else {
            return Err(Error::lock("lease file vanished during write"));
        };
        let body = serde_json::to_string(lease)?;
        file.set_len(0)
            .and_then(|()| file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| file.write_all(body.as_bytes()))
            .map_err(|e| Error::lock(format!("failed to write lease file: {e}")))?;
        let _ = FileExt::unlock(&file);
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::lock(format!("failed to remove lease file: {e}"))),
        }
    }

    fn check_environment(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.is_dir() {
                problems.push(format!(
                    "lock: lease directory {} does not exist",
                    dir.display()
                ));
            }
        }
        problems
    }

    fn check(&mut self) -> Result<Option<Lease>> {
        let me = std::process::id();
        let Some(lease) = self.read()? else {
            return Ok(None);
        };
        if lease.pid == me || !lease.is_live(self.ttl, self.padding) {
            return Ok(None);
        }
        if !pid_alive(lease.pid) {
            warn!(pid = lease.pid, "holder of the lease is gone, treating as expired");
            return Ok(None);
        }
        Ok(Some(lease))
    }
}

/// Minimal key-value backend contract for [`KvLock`].
pub trait KvStore: Send {
    /// Fetch the value at `key`.
    ///
    /// # Errors
    ///
    /// Returns a lock error when the store cannot be read.
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` at `key`.
    ///
    /// # Errors
    ///
    /// Returns a lock error when the store cannot be written.
    fn put(&mut self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove `key`.
    ///
    /// # Errors
    ///
    /// Returns a lock error when the store cannot be written.
    fn delete(&mut self, key: &str) -> Result<()>;
}

/// In-process shared map; clones share storage. Stands in for a
/// distributed store in tests and single-host deployments.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Provider over any [`KvStore`], keyed by the daemon identity.
#[derive(Debug)]
pub struct KvLock<S: KvStore> {
    store: S,
    key: String,
    ttl: f64,
    padding: f64,
}

impl<S: KvStore> KvLock<S> {
    /// Create a provider storing the lease at `key` in `store`.
    pub fn new(store: S, key: &str, ttl: f64, padding: f64) -> Self {
        Self {
            store,
            key: key.to_string(),
            ttl,
            padding,
        }
    }
}

impl<S: KvStore> LockProvider for KvLock<S> {
    fn name(&self) -> &str {
        "kv"
    }

    fn ttl(&self) -> f64 {
        self.ttl
    }

    fn padding(&self) -> f64 {
        self.padding
    }

    fn read(&mut self) -> Result<Option<Lease>> {
        match self.store.get(&self.key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write(&mut self, lease: &Lease) -> Result<()> {
        let body = serde_json::to_vec(lease)?;
        self.store.put(&self.key, &body)
    }

    fn clear(&mut self) -> Result<()> {
        self.store.delete(&self.key)
    }
}

/// Whether a process with the given pid currently exists.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // EPERM and friends still prove the pid exists.
        Err(_) => true,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn file_lock(dir: &tempfile::TempDir, ttl: f64) -> FileLock {
        FileLock::new(dir.path().join("daemon.lease"), ttl, 0.5)
    }

    #[test]
    fn test_set_claims_vacant_lease() {
        let dir = tempdir().unwrap();
        let mut lock = file_lock(&dir, 30.0);
        lock.set().unwrap();

        let lease = lock.read().unwrap().unwrap();
        assert_eq!(lease.pid, std::process::id());
        // Our own lease is never a competitor.
        assert!(lock.check().unwrap().is_none());
        // Claiming again just re-stamps.
        lock.set().unwrap();
    }

    #[test]
    fn test_set_refuses_live_foreign_lease() {
        let dir = tempdir().unwrap();
        let mut lock = file_lock(&dir, 30.0);
        // Pid 1 always exists, so the lease reads as live.
        lock.write(&Lease {
            pid: 1,
            time: epoch_now(),
        })
        .unwrap();

        let holder = lock.check().unwrap().unwrap();
        assert_eq!(holder.pid, 1);
        let err = lock.set().unwrap_err();
        assert!(matches!(err, Error::Lock { holder: Some(1), .. }));
    }

    #[test]
    fn test_expired_lease_can_be_reclaimed() {
        let dir = tempdir().unwrap();
        let mut lock = file_lock(&dir, 0.05);
        lock.write(&Lease {
            pid: 1,
            time: epoch_now() - 10.0,
        })
        .unwrap();

        assert!(lock.check().unwrap().is_none());
        lock.set().unwrap();
        assert_eq!(lock.read().unwrap().unwrap().pid, std::process::id());
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_holder_expires_early() {
        let dir = tempdir().unwrap();
        let mut lock = file_lock(&dir, 3_600.0);
        // In-range pid that cannot exist (beyond any real pid_max).
        lock.write(&Lease {
            pid: 2_000_000_000,
            time: epoch_now(),
        })
        .unwrap();

        assert!(lock.check().unwrap().is_none());
        lock.set().unwrap();
    }

    #[test]
    fn test_teardown_releases_only_own_lease() {
        let dir = tempdir().unwrap();
        let mut lock = file_lock(&dir, 30.0);

        lock.set().unwrap();
        lock.teardown().unwrap();
        assert!(lock.read().unwrap().is_none());

        lock.write(&Lease {
            pid: 1,
            time: epoch_now(),
        })
        .unwrap();
        lock.teardown().unwrap();
        assert_eq!(lock.read().unwrap().unwrap().pid, 1);
    }

    #[test]
    fn test_corrupt_lease_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.lease");
        std::fs::write(&path, "not json at all").unwrap();

        let mut lock = FileLock::new(&path, 30.0, 0.5);
        assert!(lock.read().unwrap().is_none());
        lock.set().unwrap();
    }

    #[test]
    fn test_check_environment_flags_missing_directory() {
        let lock = FileLock::new("/definitely/not/a/dir/daemon.lease", 30.0, 0.5);
        let problems = lock.check_environment();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("does not exist"));
    }

    #[test]
    fn test_kv_lock_contention_through_shared_store() {
        let store = MemoryStore::new();
        let mut first = KvLock::new(store.clone(), "svc", 30.0, 0.5);
        let mut second = KvLock::new(store, "svc", 30.0, 0.5);

        first.set().unwrap();
        // Same process id on both handles, so the lease reads as our own;
        // fake a foreign holder to model a second host.
        second
            .write(&Lease {
                pid: 1,
                time: epoch_now(),
            })
            .unwrap();
        assert!(first.set().is_err());

        second.clear().unwrap();
        first.set().unwrap();
    }

    #[test]
    fn test_null_lock_never_blocks() {
        let mut lock = NullLock;
        assert!(lock.check().unwrap().is_none());
        lock.set().unwrap();
        lock.set().unwrap();
        lock.teardown().unwrap();
    }
}
