//! Veil agent - injected into the client process to instrument its native
//! library.
//!
//! Compiled as a cdylib and loaded next to the client library. On load it
//! initializes logging and arms the section remapper; the managed side then
//! pushes its configuration and calls `veil_initialize`, which locates the
//! client library, installs the inline hooks and remaps the agent's own
//! mappings to anonymous memory.

pub mod bridge;
pub mod config;
pub mod context;
pub mod error;
pub mod ffi;
pub mod hooks;
pub mod locator;
pub mod mutex;
pub mod orchestrator;
pub mod remap;

#[cfg(test)]
mod test_utils;

pub use bridge::{CallBridge, DirectRuntime, ManagedCallable, ManagedRuntime};
pub use config::{AgentSettings, NativeConfig, NativeConfigRecord};
pub use context::NativeContext;
pub use error::{AgentError, BridgeError, LockError, RemapError, ResolveError};
pub use hooks::{CallShape, HookDescriptor, InlineHookEngine, TargetResolver, Verdict};
pub use locator::{ModuleTable, TargetModule};
pub use mutex::MutexRegistry;
pub use orchestrator::initialize;
pub use remap::{remap_sections, RemapReport, SectionRemapper};
