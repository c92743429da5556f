//! Process-wide agent state, passed explicitly to every component.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, RwLock};

use log::warn;

use crate::bridge::CallBridge;
use crate::config::{AgentSettings, ConfigCell, NativeConfig};
use crate::hooks::duplex::DuplexHandler;
use crate::hooks::mutex_guard::ConnectionTable;
use crate::hooks::script::ScriptState;
use crate::hooks::unary::UnaryHandler;
use crate::hooks::HookDescriptor;
use crate::locator::TargetModule;
use crate::mutex::MutexRegistry;
use crate::remap::SectionRemapper;

pub struct NativeContext {
    settings: AgentSettings,
    config: ConfigCell,
    target: OnceLock<TargetModule>,
    hooks: Mutex<Vec<HookDescriptor>>,
    registry: MutexRegistry,
    connections: ConnectionTable,
    bridge: CallBridge,
    script: ScriptState,
    remapper: SectionRemapper,
    unary_handler: RwLock<Option<UnaryHandler>>,
    duplex_handler: RwLock<Option<DuplexHandler>>,
    ready: AtomicBool,
    pub(crate) init_result: OnceLock<bool>,
}

impl NativeContext {
    pub fn new(settings: AgentSettings) -> Self {
        Self {
            settings,
            config: ConfigCell::default(),
            target: OnceLock::new(),
            hooks: Mutex::new(Vec::new()),
            registry: MutexRegistry::new(),
            connections: ConnectionTable::default(),
            bridge: CallBridge::new(),
            script: ScriptState::default(),
            remapper: SectionRemapper::new(),
            unary_handler: RwLock::new(None),
            duplex_handler: RwLock::new(None),
            ready: AtomicBool::new(false),
            init_result: OnceLock::new(),
        }
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn config(&self) -> NativeConfig {
        self.config.get()
    }

    /// Copy flags from the managed side. Ignored once hooks have been selected.
    pub fn load_config(&self, config: NativeConfig) -> bool {
        let stored = self.config.store(config);
        if !stored {
            warn!("configuration arrived after initialization, ignored");
        }
        stored
    }

    pub(crate) fn freeze_config(&self) {
        self.config.freeze();
    }

    pub fn target(&self) -> Option<&TargetModule> {
        self.target.get()
    }

    pub(crate) fn set_target(&self, module: TargetModule) -> &TargetModule {
        self.target.get_or_init(|| module)
    }

    fn hook_table(&self) -> MutexGuard<'_, Vec<HookDescriptor>> {
        self.hooks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn record_hooks(&self, installed: Vec<HookDescriptor>) {
        self.hook_table().extend(installed);
    }

    /// Snapshot of every installed hook.
    pub fn hooks(&self) -> Vec<HookDescriptor> {
        self.hook_table().clone()
    }

    pub fn registry(&self) -> &MutexRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn bridge(&self) -> &CallBridge {
        &self.bridge
    }

    pub fn script(&self) -> &ScriptState {
        &self.script
    }

    pub fn remapper(&self) -> &SectionRemapper {
        &self.remapper
    }

    pub fn unary_handler(&self) -> Option<UnaryHandler> {
        self.unary_handler.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_unary_handler(&self, handler: Option<UnaryHandler>) {
        *self.unary_handler.write().unwrap_or_else(|e| e.into_inner()) = handler;
    }

    pub fn duplex_handler(&self) -> Option<DuplexHandler> {
        self.duplex_handler.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_duplex_handler(&self, handler: Option<DuplexHandler>) {
        *self.duplex_handler.write().unwrap_or_else(|e| e.into_inner()) = handler;
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }
}

impl Default for NativeContext {
    fn default() -> Self {
        Self::new(AgentSettings::default())
    }
}

impl std::fmt::Debug for NativeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeContext")
            .field("config", &self.config())
            .field("target", &self.target())
            .field("hooks", &self.hook_table().len())
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}
