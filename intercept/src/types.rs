use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("module not loaded: {0}")]
    ModuleNotLoaded(String),

    #[error("function is already hooked")]
    AlreadyAttached,

    #[error("failed to allocate code memory")]
    AllocationFailed,

    #[error("failed to change page protection")]
    ProtectFailed,

    #[error("prologue cannot be relocated")]
    RelocationFailed,

    #[error("invalid signature pattern: {0}")]
    InvalidPattern(String),

    #[error("unsupported on this platform")]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    pub base_address: usize,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    pub name: String,
    pub address: usize,
}

/// Page protection of a mapping as printed in `/proc/<pid>/maps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub private: bool,
}

impl Protection {
    /// The `PROT_*` bits for `mmap`/`mprotect`.
    #[cfg(unix)]
    pub fn to_prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.read {
            prot |= libc::PROT_READ;
        }
        if self.write {
            prot |= libc::PROT_WRITE;
        }
        if self.exec {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// One line of `/proc/self/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: usize,
    pub end: usize,
    pub protection: Protection,
    pub offset: u64,
    pub path: String,
}

impl MemoryMapping {
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.start && address < self.end
    }
}
