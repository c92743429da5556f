//! libc `fstat`: hides cache and queue files the configuration disables.

use std::ffi::c_int;

use log::debug;

use super::{current_context, enter_hook, CallShape, HookAdapter, HookPoint, HookSlot, HookTargets};
use crate::config::NativeConfig;

pub type FstatFn = unsafe extern "C" fn(fd: c_int, buf: *mut libc::stat) -> c_int;

pub(crate) static ORIGINAL: HookSlot = HookSlot::new();

const METRICS_QUEUES: &str = "files/blizzardv2/queues";
const AVATAR_CONTENT: &str = "com.snap.file_manager_4_SCContent";

/// True if `path` is hidden under `config`.
pub fn is_denied(config: &NativeConfig, path: &str) -> bool {
    (config.disable_metrics && path.contains(METRICS_QUEUES)) || (config.disable_bitmoji && path.contains(AVATAR_CONTENT))
}

fn fd_path(fd: c_int) -> Option<String> {
    std::fs::read_link(format!("/proc/self/fd/{fd}"))
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

fn set_errno(value: c_int) {
    #[cfg(target_os = "android")]
    unsafe {
        *libc::__errno() = value;
    }
    #[cfg(target_os = "linux")]
    unsafe {
        *libc::__errno_location() = value;
    }
    #[cfg(not(linux_like))]
    let _ = value;
}

unsafe extern "C" fn fstat_replacement(fd: c_int, buf: *mut libc::stat) -> c_int {
    let Some(original) = ORIGINAL.get() else {
        set_errno(libc::EAGAIN);
        return -1;
    };
    let original: FstatFn = core::mem::transmute(original);

    if let Some(_guard) = enter_hook() {
        if let Some(ctx) = current_context() {
            let config = ctx.config();
            if config.disable_metrics || config.disable_bitmoji {
                if let Some(path) = fd_path(fd) {
                    if is_denied(&config, &path) {
                        debug!("fstat({fd}) hidden: {path}");
                        set_errno(libc::ENOENT);
                        return -1;
                    }
                }
            }
        }
    }
    original(fd, buf)
}

pub struct FileStatusAdapter;

impl HookAdapter for FileStatusAdapter {
    fn shape(&self) -> CallShape {
        CallShape::FileStatus
    }

    fn points<'t>(&self, targets: &'t HookTargets) -> Vec<HookPoint<'t>> {
        vec![HookPoint {
            name: "fstat",
            resolver: &targets.fstat,
            replacement: Some(fstat_replacement as *const () as usize),
            slot: &ORIGINAL,
        }]
    }
}
