//! Startup sequence: locate, hook, remap, report ready.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};

use crate::context::NativeContext;
use crate::hooks::{self, HookAdapter, InlineHookEngine};
use crate::locator::{self, ModuleTable};

/// Run initialization once; later calls return the first result.
///
/// Returns false only when no target module candidate is loaded, in which
/// case nothing has been patched.
pub fn initialize(ctx: &'static NativeContext, table: &dyn ModuleTable, engine: &dyn InlineHookEngine) -> bool {
    *ctx.init_result.get_or_init(|| match run(ctx, table, engine) {
        Ok(()) => true,
        Err(e) => {
            error!("initialization failed: {e:#}");
            false
        }
    })
}

fn run(ctx: &'static NativeContext, table: &dyn ModuleTable, engine: &dyn InlineHookEngine) -> Result<()> {
    info!("initializing native hooks");
    ctx.freeze_config();

    let candidates = locator::candidates(ctx.settings().target_module.as_deref());
    let module = locator::locate(table, &candidates).context("locating target module")?;
    let module = ctx.set_target(module);
    info!("{} at {:#x}, size {:#x}", module.name, module.base, module.size);

    hooks::bind_context(ctx);
    let installed = install_adapters(ctx, engine, &hooks::adapters());
    info!("{installed} hooks installed");

    if ctx.settings().skip_remap {
        debug!("section remapping disabled");
    } else if !ctx.remapper().is_armed() {
        debug!("section remapper not armed");
    } else {
        ctx.remapper().fire();
    }

    ctx.mark_ready();
    Ok(())
}

/// Install every enabled adapter; failures are logged and skipped.
pub fn install_adapters(ctx: &NativeContext, engine: &dyn InlineHookEngine, adapters: &[&dyn HookAdapter]) -> usize {
    let config = ctx.config();
    let mut count = 0;
    for adapter in adapters {
        let shape = adapter.shape();
        if !adapter.enabled(&config) {
            debug!("{shape} hook disabled by configuration");
            continue;
        }
        match adapter.install(ctx, engine) {
            Ok(installed) => {
                for hook in &installed {
                    debug!("{shape} hook {} at {:#x} -> {:#x}", hook.name, hook.target, hook.replacement);
                }
                count += installed.len();
                ctx.record_hooks(installed);
            }
            Err(e) => warn!("{shape} hook unavailable: {e}"),
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentSettings, NativeConfig};
    use crate::hooks::CallShape;
    use crate::locator::{PRIMARY_MODULE, SPLIT_MODULE};
    use crate::test_utils::{code_module, leak, lock_agent_tests, offset_targets, FakeModuleTable, RecordingEngine};

    fn settings() -> AgentSettings {
        AgentSettings {
            skip_remap: true,
            ..AgentSettings::default()
        }
        .with_targets(offset_targets())
    }

    fn table_with_code() -> FakeModuleTable {
        let module = code_module(0x1000);
        FakeModuleTable::new().with(PRIMARY_MODULE, module.base, module.size)
    }

    #[test]
    fn missing_module_installs_nothing() {
        let _g = lock_agent_tests();
        let ctx = leak(settings());
        let engine = RecordingEngine::new();

        assert!(!initialize(ctx, &FakeModuleTable::new(), &engine));
        assert!(engine.installs().is_empty());
        assert!(ctx.hooks().is_empty());
        assert!(ctx.target().is_none());
        assert!(!ctx.is_ready());
    }

    #[test]
    fn core_hooks_installed_without_script_eval() {
        let _g = lock_agent_tests();
        let ctx = leak(settings());
        let engine = RecordingEngine::new();

        assert!(initialize(ctx, &table_with_code(), &engine));
        assert!(ctx.is_ready());

        let shapes: Vec<CallShape> = ctx.hooks().iter().map(|h| h.shape).collect();
        assert_eq!(
            shapes,
            vec![
                CallShape::Unary,
                CallShape::FileStatus,
                CallShape::MutexGuard,
                CallShape::MutexGuard,
                CallShape::Duplex,
            ]
        );
        assert_eq!(engine.installs().len(), 5);
        assert!(!ctx.hooks().iter().any(|h| h.shape == CallShape::ScriptEval));
    }

    #[test]
    fn composer_flag_adds_script_eval() {
        let _g = lock_agent_tests();
        let ctx = leak(settings());
        assert!(ctx.load_config(NativeConfig {
            composer_hooks: true,
            ..NativeConfig::default()
        }));
        let engine = RecordingEngine::new();

        assert!(initialize(ctx, &table_with_code(), &engine));
        let eval = ctx
            .hooks()
            .into_iter()
            .find(|h| h.shape == CallShape::ScriptEval)
            .expect("script-eval installed");
        assert_eq!(eval.name, "script_eval");
        assert_eq!(engine.installs().len(), 6);
        // Configuration is frozen once hooks are chosen.
        assert!(!ctx.load_config(NativeConfig::default()));
    }

    #[test]
    fn second_call_does_not_reinstall() {
        let _g = lock_agent_tests();
        let ctx = leak(settings());
        let engine = RecordingEngine::new();

        assert!(initialize(ctx, &table_with_code(), &engine));
        let first = engine.installs().len();
        assert!(initialize(ctx, &table_with_code(), &engine));
        assert_eq!(engine.installs().len(), first);
    }

    #[test]
    fn split_apk_module_is_used() {
        let _g = lock_agent_tests();
        let ctx = leak(settings());
        let module = code_module(0x1000);
        let table = FakeModuleTable::new().with(SPLIT_MODULE, module.base, module.size);

        assert!(initialize(ctx, &table, &RecordingEngine::new()));
        assert_eq!(ctx.target().unwrap().base, module.base);
        assert_eq!(ctx.target().unwrap().name, SPLIT_MODULE);
    }

    #[test]
    fn failing_adapter_does_not_fail_initialization() {
        let _g = lock_agent_tests();
        let mut targets = offset_targets();
        targets.unary_call = crate::hooks::TargetResolver::Offset { offset: 0x10_0000 };
        let ctx = leak(AgentSettings {
            skip_remap: true,
            targets,
            ..AgentSettings::default()
        });
        let engine = RecordingEngine::new();

        assert!(initialize(ctx, &table_with_code(), &engine));
        assert!(!ctx.hooks().iter().any(|h| h.shape == CallShape::Unary));
        assert_eq!(engine.installs().len(), 4);
    }
}
