//! Keyed mutex registry.
//!
//! One recursive pthread mutex per resource key (a database file name),
//! shared by native call sites inside the database hooks and by managed
//! callers going through `veil_lock_resource`. Entries are created lazily and
//! never removed.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error};

use crate::error::LockError;

/// A resource key and the mutex that serializes access to it.
pub struct MutexEntry {
    key: String,
    // Boxed so the pthread object never moves after init.
    raw: Box<UnsafeCell<libc::pthread_mutex_t>>,
}

// The pthread mutex is the synchronization primitive itself.
unsafe impl Send for MutexEntry {}
unsafe impl Sync for MutexEntry {}

impl MutexEntry {
    fn new(key: &str) -> Result<Self, LockError> {
        Self::with_kind(key, libc::PTHREAD_MUTEX_RECURSIVE)
    }

    fn with_kind(key: &str, kind: libc::c_int) -> Result<Self, LockError> {
        let raw = Box::new(UnsafeCell::new(unsafe { std::mem::zeroed::<libc::pthread_mutex_t>() }));
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            let rc = libc::pthread_mutexattr_init(&mut attr);
            if rc != 0 {
                return Err(LockError::Init(rc));
            }
            let rc = libc::pthread_mutexattr_settype(&mut attr, kind);
            if rc != 0 {
                libc::pthread_mutexattr_destroy(&mut attr);
                return Err(LockError::Init(rc));
            }
            let rc = libc::pthread_mutex_init(raw.get(), &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            if rc != 0 {
                return Err(LockError::Init(rc));
            }
        }
        Ok(Self {
            key: key.to_string(),
            raw,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Block until this thread holds the mutex. Recursive on the owning thread.
    pub fn lock(&self) -> Result<EntryGuard<'_>, LockError> {
        match unsafe { libc::pthread_mutex_lock(self.raw.get()) } {
            0 => Ok(EntryGuard(self)),
            rc => Err(LockError::Lock(rc)),
        }
    }
}

impl Drop for MutexEntry {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_destroy(self.raw.get());
        }
    }
}

impl std::fmt::Debug for MutexEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexEntry").field("key", &self.key).finish_non_exhaustive()
    }
}

/// Unlocks on drop, including while unwinding.
pub struct EntryGuard<'a>(&'a MutexEntry);

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.0.raw.get()) };
        if rc != 0 {
            error!("pthread_mutex_unlock({}) failed: {rc}", self.0.key);
        }
    }
}

#[derive(Debug, Default)]
pub struct MutexRegistry {
    // Guards the map only; never held while a per-key mutex is taken.
    table: Mutex<HashMap<String, Arc<MutexEntry>>>,
}

impl MutexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<MutexEntry>>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The entry for `key`, created on first use.
    pub fn acquire_for(&self, key: &str) -> Result<Arc<MutexEntry>, LockError> {
        let mut table = self.table();
        if let Some(entry) = table.get(key) {
            return Ok(Arc::clone(entry));
        }
        let entry = Arc::new(MutexEntry::new(key)?);
        debug!("created mutex entry for {key}");
        table.insert(key.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    /// The entry for `key` if one exists. Never creates.
    pub fn lookup(&self, key: &str) -> Option<Arc<MutexEntry>> {
        self.table().get(key).cloned()
    }

    /// Run `f` while holding the mutex for `key`.
    ///
    /// A key without an entry runs `f` unguarded. If the lock itself fails the
    /// error is logged and `f` still runs, without mutual exclusion for that
    /// one call.
    pub fn run_under_lock<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
        let Some(entry) = self.lookup(key) else {
            return f();
        };
        let _guard = match entry.lock() {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!("{key}: {e}, running unguarded");
                None
            }
        };
        f()
    }

    #[cfg(test)]
    fn insert(&self, entry: MutexEntry) -> Arc<MutexEntry> {
        let entry = Arc::new(entry);
        self.table().insert(entry.key().to_string(), Arc::clone(&entry));
        entry
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
