//! Target module discovery.

use log::debug;
use veil_intercept::{module, ModuleInfo};

use crate::error::ResolveError;

/// Name the client library is normally loaded under.
pub const PRIMARY_MODULE: &str = "libclient.so";

/// Split APK that carries the native code when the library is loaded in place.
#[cfg(target_pointer_width = "64")]
pub const SPLIT_MODULE: &str = "split_config.arm64_v8a.apk";
#[cfg(not(target_pointer_width = "64"))]
pub const SPLIT_MODULE: &str = "split_config.armeabi-v7a.apk";

/// The located library. Written once during initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetModule {
    pub name: String,
    pub path: String,
    pub base: usize,
    pub size: usize,
}

impl TargetModule {
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.end()
    }
}

impl From<ModuleInfo> for TargetModule {
    fn from(info: ModuleInfo) -> Self {
        Self {
            name: info.name,
            path: info.path,
            base: info.base_address,
            size: info.size,
        }
    }
}

/// A view of the modules loaded in this process.
pub trait ModuleTable {
    fn find(&self, name: &str) -> Option<ModuleInfo>;
}

/// Objects registered with the dynamic loader.
pub struct LoadedModules;

impl ModuleTable for LoadedModules {
    fn find(&self, name: &str) -> Option<ModuleInfo> {
        module::find_module_by_name(name)
    }
}

/// File mappings in `/proc/self/maps`, for code mapped straight out of an APK.
pub struct MappedModules;

impl ModuleTable for MappedModules {
    fn find(&self, name: &str) -> Option<ModuleInfo> {
        module::find_mapped_module(name)
    }
}

/// Loader first, then mappings.
pub struct ProcessModules;

impl ModuleTable for ProcessModules {
    fn find(&self, name: &str) -> Option<ModuleInfo> {
        LoadedModules.find(name).or_else(|| MappedModules.find(name))
    }
}

/// Candidate names in lookup order.
pub fn candidates(primary: Option<&str>) -> Vec<String> {
    vec![primary.unwrap_or(PRIMARY_MODULE).to_string(), SPLIT_MODULE.to_string()]
}

/// First candidate present in `table`; later candidates are not consulted.
pub fn locate(table: &dyn ModuleTable, candidates: &[String]) -> Result<TargetModule, ResolveError> {
    for name in candidates {
        match table.find(name) {
            Some(info) if info.size > 0 => {
                debug!("{name} found at {:#x} ({:#x} bytes)", info.base_address, info.size);
                return Ok(info.into());
            }
            _ => debug!("{name} not loaded"),
        }
    }
    Err(ResolveError::ModuleNotFound(candidates.to_vec()))
}
