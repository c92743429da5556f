//! Error types for the agent.
//!
//! Only [`ResolveError::ModuleNotFound`] is ever surfaced to the embedder (as
//! `false` from `veil_initialize`); everything else is logged where it occurs.

use thiserror::Error;
use veil_intercept::HookError;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("target module not found (tried {0:?})")]
    ModuleNotFound(Vec<String>),

    #[error("offset {offset:#x} is outside the target module ({size:#x} bytes)")]
    OffsetOutOfRange { offset: usize, size: usize },

    #[error("signature not found in target module: {0}")]
    SignatureNotFound(String),

    #[error("no candidate resolved")]
    Exhausted,

    #[error(transparent)]
    Lookup(#[from] HookError),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("pthread_mutex_init failed: {0}")]
    Init(i32),

    #[error("pthread_mutex_lock failed: {0}")]
    Lock(i32),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("managed callable is null")]
    NullCallable,

    #[error("string contains an interior NUL byte")]
    InteriorNul,

    #[error("native result is not valid UTF-8")]
    InvalidUtf8,

    #[error("native routine returned no result")]
    NullResult,

    #[error("no script context has been captured yet")]
    NoScriptContext,

    #[error("script evaluation hook is not installed")]
    NotInstalled,
}

#[derive(Debug, Error)]
pub enum RemapError {
    #[error("failed to read /proc/self/maps: {0}")]
    Maps(#[from] std::io::Error),

    #[error("mmap of {size:#x} bytes failed (errno {errno})")]
    Map { size: usize, errno: i32 },

    #[error("mprotect at {address:#x} failed (errno {errno})")]
    Protect { address: usize, errno: i32 },

    #[error("mremap onto {address:#x} failed (errno {errno})")]
    Remap { address: usize, errno: i32 },

    #[error("section remapping is unsupported on this platform")]
    Unsupported,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("target module has not been located")]
    NoTargetModule,

    #[error("{hook}: {source}")]
    Resolve {
        hook: &'static str,
        #[source]
        source: ResolveError,
    },

    #[error("{hook}: {source}")]
    Install {
        hook: &'static str,
        #[source]
        source: HookError,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

pub(crate) fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
