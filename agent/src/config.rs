//! Feature flags pushed from the managed side and settings read from the
//! environment at process attach.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::hooks::HookTargets;

/// Feature toggles copied from the managed side before `initialize`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NativeConfig {
    /// Hide the avatar content cache from file-status checks.
    pub disable_bitmoji: bool,
    /// Hide the metrics upload queues from file-status checks.
    pub disable_metrics: bool,
    /// Install the script-eval hook.
    pub composer_hooks: bool,
}

/// C layout of [`NativeConfig`]; any non-zero byte is true.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeConfigRecord {
    pub disable_bitmoji: u8,
    pub disable_metrics: u8,
    pub composer_hooks: u8,
}

impl From<NativeConfigRecord> for NativeConfig {
    fn from(record: NativeConfigRecord) -> Self {
        Self {
            disable_bitmoji: record.disable_bitmoji != 0,
            disable_metrics: record.disable_metrics != 0,
            composer_hooks: record.composer_hooks != 0,
        }
    }
}

const BITMOJI: u8 = 1 << 0;
const METRICS: u8 = 1 << 1;
const COMPOSER: u8 = 1 << 2;

impl NativeConfig {
    pub fn from_json(json: &str) -> Result<Self, AgentError> {
        Ok(serde_json::from_str(json)?)
    }

    fn to_bits(self) -> u8 {
        (self.disable_bitmoji as u8 * BITMOJI) | (self.disable_metrics as u8 * METRICS) | (self.composer_hooks as u8 * COMPOSER)
    }

    fn from_bits(bits: u8) -> Self {
        Self {
            disable_bitmoji: bits & BITMOJI != 0,
            disable_metrics: bits & METRICS != 0,
            composer_hooks: bits & COMPOSER != 0,
        }
    }
}

/// Configuration storage readable from hook bodies without locking.
///
/// Writable until [`ConfigCell::freeze`], which the orchestrator calls once
/// hook selection is done.
#[derive(Debug, Default)]
pub struct ConfigCell {
    bits: AtomicU8,
    frozen: AtomicBool,
}

impl ConfigCell {
    pub fn new(config: NativeConfig) -> Self {
        Self {
            bits: AtomicU8::new(config.to_bits()),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn get(&self) -> NativeConfig {
        NativeConfig::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Store `config`; returns false once frozen.
    pub fn store(&self, config: NativeConfig) -> bool {
        if self.frozen.load(Ordering::Acquire) {
            return false;
        }
        self.bits.store(config.to_bits(), Ordering::Release);
        true
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }
}

/// Identifier of the mappings the section remapper rewrites: the build-time
/// `VEIL_PACKAGE`, else this crate's name.
pub fn default_owner_id() -> &'static str {
    option_env!("VEIL_PACKAGE").unwrap_or(env!("CARGO_PKG_NAME"))
}

/// Process settings taken from the environment at attach time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    /// Replaces the primary module candidate (`VEIL_TARGET_MODULE`).
    pub target_module: Option<String>,
    /// Mapping path fragment to remap (`VEIL_OWNER_ID`).
    pub owner_id: String,
    /// `VEIL_SKIP_REMAP=1` leaves mappings untouched.
    pub skip_remap: bool,
    /// Hook target table (`VEIL_TARGETS` names a JSON file).
    pub targets: HookTargets,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            target_module: None,
            owner_id: default_owner_id().to_string(),
            skip_remap: false,
            targets: HookTargets::default(),
        }
    }
}

impl AgentSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let targets = match non_empty("VEIL_TARGETS") {
            Some(path) => load_targets(Path::new(&path)).unwrap_or_else(|e| {
                warn!("ignoring hook targets from {path}: {e:#}");
                HookTargets::default()
            }),
            None => HookTargets::default(),
        };

        Self {
            target_module: non_empty("VEIL_TARGET_MODULE"),
            owner_id: non_empty("VEIL_OWNER_ID").unwrap_or_else(|| default_owner_id().to_string()),
            skip_remap: matches!(non_empty("VEIL_SKIP_REMAP").as_deref(), Some("1" | "true")),
            targets,
        }
    }

    pub fn with_targets(mut self, targets: HookTargets) -> Self {
        self.targets = targets;
        self
    }
}

fn load_targets(path: &Path) -> anyhow::Result<HookTargets> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
