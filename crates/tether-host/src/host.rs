use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mlua::Lua;
use tokio::runtime::Runtime;
use tracing::{debug, info};

use tether_bridge::{BridgeContext, CallbackDispatcher, EventQueue};
use tether_modules::shell::{ShellConnector, ShellConnectors};

use crate::config::HostConfig;
use crate::error::HostError;
use crate::registry;

/// How a call to [`ScriptHost::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub tasks: usize,
    /// The queue was shut down (e.g. Ctrl-C) rather than running out of work.
    pub interrupted: bool,
}

/// One interpreter, the runtime its native modules use, and the run loop
/// between them.
///
/// Every method must be called from the thread that created the host.
pub struct ScriptHost {
    lua: Lua,
    ctx: BridgeContext,
    dispatcher: CallbackDispatcher,
    modules: Vec<&'static str>,
    close_timeout: Duration,
    runtime: Option<Runtime>,
}

impl ScriptHost {
    pub fn new(config: &HostConfig) -> Result<Self, HostError> {
        let modules = registry::resolve(&config.modules.enabled)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.runtime.worker_threads.max(1))
            .thread_name("tether-worker")
            .enable_all()
            .build()
            .map_err(HostError::Runtime)?;

        let ctx = BridgeContext::new(runtime.handle().clone(), config.bridge_settings());
        let lua = Lua::new();
        ctx.install(&lua);
        config.module_settings().install(&lua);
        lua.set_app_data(ShellConnectors::new());
        registry::install(&lua, &modules)?;

        let dispatcher = CallbackDispatcher::with_strict(config.runtime.strict_callbacks);
        let modules: Vec<_> = modules.into_iter().map(|(name, _)| name).collect();
        info!(
            target: "host",
            "Script host ready (modules: {}, strict: {})",
            modules.join(", "),
            dispatcher.is_strict()
        );

        Ok(Self {
            lua,
            ctx,
            dispatcher,
            modules,
            close_timeout: config.bridge_settings().close_timeout,
            runtime: Some(runtime),
        })
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn context(&self) -> &BridgeContext {
        &self.ctx
    }

    pub fn queue(&self) -> Arc<EventQueue> {
        self.ctx.queue().clone()
    }

    pub fn dispatcher(&self) -> &CallbackDispatcher {
        &self.dispatcher
    }

    pub fn modules(&self) -> &[&'static str] {
        &self.modules
    }

    /// Make an extra shell transport (e.g. SSH) available to `shell.connect`.
    pub fn register_connector(&self, connector: Arc<dyn ShellConnector>) {
        debug!(target: "host", "Registered shell transport '{}'", connector.name());
        ShellConnectors::install(&self.lua, connector);
    }

    /// Expose `args` to scripts as the global `arg` table.
    pub fn set_args(&self, args: &[String]) -> Result<(), HostError> {
        let table = self.lua.create_sequence_from(args.iter().cloned())?;
        self.lua.globals().set("arg", table)?;
        Ok(())
    }

    pub fn exec_str(&self, name: &str, source: &str) -> Result<(), HostError> {
        self.lua.load(source).set_name(name).exec()?;
        Ok(())
    }

    pub fn exec_file(&self, path: &Path) -> Result<(), HostError> {
        let source = fs::read_to_string(path).map_err(|source| HostError::ReadScript {
            path: path.display().to_string(),
            source,
        })?;
        info!(target: "host", "Running {}", path.display());
        self.exec_str(&format!("@{}", path.display()), &source)
    }

    /// Run the tasks already queued without waiting for more.
    pub fn run_pending(&self) -> Result<usize, HostError> {
        Ok(self.ctx.queue().run_pending(&self.lua, &self.dispatcher)?)
    }

    /// Run until no handle produces events and the queue is empty, or the
    /// queue is shut down.
    pub fn run(&self) -> Result<RunSummary, HostError> {
        let tasks = self.ctx.queue().drain(&self.lua, &self.dispatcher)?;
        let summary = RunSummary {
            tasks,
            interrupted: self.ctx.queue().is_shutdown(),
        };
        debug!(target: "host", "Run loop finished: {:?}", summary);
        Ok(summary)
    }

    /// Like [`run`](Self::run), returning after `timeout` even if sources
    /// are still active.
    pub fn run_for(&self, timeout: Duration) -> Result<RunSummary, HostError> {
        let tasks = self
            .ctx
            .queue()
            .drain_for(&self.lua, &self.dispatcher, timeout)?;
        Ok(RunSummary {
            tasks,
            interrupted: self.ctx.queue().is_shutdown(),
        })
    }

    /// Close every handle the script left open. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        self.ctx.handles().sweep()
    }
}

impl Drop for ScriptHost {
    fn drop(&mut self) {
        let swept = self.close_all();
        if swept > 0 {
            info!(target: "host", "Closed {} handle(s) left open by the script", swept);
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(self.close_timeout);
        }
    }
}
