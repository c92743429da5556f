pub mod maps;
pub mod scan;

#[cfg(linux_like)]
mod linux;

#[cfg(linux_like)]
pub use linux::*;

#[cfg(not(linux_like))]
use crate::types::{ExportInfo, HookError, ModuleInfo};

#[cfg(not(linux_like))]
pub fn enumerate_modules() -> Vec<ModuleInfo> {
    Vec::new()
}

#[cfg(not(linux_like))]
pub fn find_module_by_name(_name: &str) -> Option<ModuleInfo> {
    None
}

#[cfg(not(linux_like))]
pub fn find_mapped_module(_suffix: &str) -> Option<ModuleInfo> {
    None
}

#[cfg(not(linux_like))]
pub fn find_global_export_by_name(_symbol: &str) -> Result<usize, HookError> {
    Err(HookError::Unsupported)
}

#[cfg(not(linux_like))]
pub fn find_export_by_name(_module_name: &str, _symbol: &str) -> Result<usize, HookError> {
    Err(HookError::Unsupported)
}

#[cfg(not(linux_like))]
pub fn find_module_in_range(_start: usize, _size: usize) -> Option<ModuleInfo> {
    None
}

#[cfg(not(linux_like))]
pub fn find_export_in_range(_start: usize, _size: usize, _symbol: &str) -> Result<usize, HookError> {
    Err(HookError::Unsupported)
}

#[cfg(not(linux_like))]
pub fn enumerate_exports(_module_name: &str) -> Result<Vec<ExportInfo>, HookError> {
    Err(HookError::Unsupported)
}

#[cfg(not(linux_like))]
pub fn scan_range(_signature: &scan::Signature, _start: usize, _size: usize) -> Option<usize> {
    None
}

#[cfg(not(linux_like))]
pub fn scan_module(_signature: &scan::Signature, _start: usize, _size: usize, _path: &str) -> Option<usize> {
    None
}
