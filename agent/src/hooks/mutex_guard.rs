//! Embedded database open/exec.
//!
//! A successful open registers the database file name with the mutex
//! registry and remembers which connection belongs to it. Statements run on
//! a known connection then execute under that key, so they never interleave
//! with managed code holding the same lock through `veil_lock_resource`.

use std::collections::HashMap;
use std::ffi::{c_char, c_int, CStr};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use core::ffi::c_void;
use log::{debug, error};

use super::{current_context, enter_hook, CallShape, HookAdapter, HookPoint, HookSlot, HookTargets};

pub type OpenFn =
    unsafe extern "C" fn(filename: *const c_char, db: *mut *mut c_void, flags: c_int, vfs: *const c_char) -> c_int;

pub type ExecFn = unsafe extern "C" fn(
    db: *mut c_void,
    sql: *const c_char,
    callback: *mut c_void,
    arg: *mut c_void,
    errmsg: *mut *mut c_char,
) -> c_int;

const SQLITE_OK: c_int = 0;
const SQLITE_BUSY: c_int = 5;

pub(crate) static OPEN: HookSlot = HookSlot::new();
pub(crate) static EXEC: HookSlot = HookSlot::new();

/// Registry key for a database path: its file name.
pub fn database_key(filename: &str) -> Option<&str> {
    Path::new(filename).file_name()?.to_str()
}

/// Connection handle to registry key.
#[derive(Debug, Default)]
pub struct ConnectionTable(RwLock<HashMap<usize, String>>);

impl ConnectionTable {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<usize, String>> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<usize, String>> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Handles are reused after close, so a later open simply overwrites.
    pub fn bind(&self, connection: usize, key: &str) {
        self.write().insert(connection, key.to_string());
    }

    pub fn key_for(&self, connection: usize) -> Option<String> {
        self.read().get(&connection).cloned()
    }
}

unsafe extern "C" fn open_replacement(
    filename: *const c_char,
    db: *mut *mut c_void,
    flags: c_int,
    vfs: *const c_char,
) -> c_int {
    let Some(original) = OPEN.get() else {
        return SQLITE_BUSY;
    };
    let original: OpenFn = core::mem::transmute(original);

    let rc = original(filename, db, flags, vfs);
    if rc != SQLITE_OK || filename.is_null() || db.is_null() || (*db).is_null() {
        return rc;
    }

    if let (Some(_guard), Some(ctx)) = (enter_hook(), current_context()) {
        let filename = CStr::from_ptr(filename).to_string_lossy();
        if let Some(key) = database_key(&filename) {
            match ctx.registry().acquire_for(key) {
                Ok(_) => {
                    ctx.connections().bind(*db as usize, key);
                    debug!("database {key} opened as {:p}", *db);
                }
                Err(e) => error!("no mutex for {key}: {e}"),
            }
        }
    }
    rc
}

unsafe extern "C" fn exec_replacement(
    db: *mut c_void,
    sql: *const c_char,
    callback: *mut c_void,
    arg: *mut c_void,
    errmsg: *mut *mut c_char,
) -> c_int {
    let Some(original) = EXEC.get() else {
        return SQLITE_BUSY;
    };
    let original: ExecFn = core::mem::transmute(original);

    let key = current_context().and_then(|ctx| Some((ctx, ctx.connections().key_for(db as usize)?)));
    match key {
        Some((ctx, key)) => ctx.registry().run_under_lock(&key, || original(db, sql, callback, arg, errmsg)),
        None => original(db, sql, callback, arg, errmsg),
    }
}

pub struct MutexGuardAdapter;

impl HookAdapter for MutexGuardAdapter {
    fn shape(&self) -> CallShape {
        CallShape::MutexGuard
    }

    fn points<'t>(&self, targets: &'t HookTargets) -> Vec<HookPoint<'t>> {
        vec![
            HookPoint {
                name: "database_open",
                resolver: &targets.database_open,
                replacement: Some(open_replacement as *const () as usize),
                slot: &OPEN,
            },
            HookPoint {
                name: "database_exec",
                resolver: &targets.database_exec,
                replacement: Some(exec_replacement as *const () as usize),
                slot: &EXEC,
            },
        ]
    }
}
