//! Shared setup for module integration tests: one interpreter with every
//! module installed as a global, plus a bounded run loop.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use mlua::{FromLuaMulti, Lua};
use tether_bridge::{BridgeContext, BridgeSettings, CallbackDispatcher, Next};
use tether_modules::{MODULES, ModuleSettings};

pub struct Harness {
    // Field order matters: the interpreter (and the handles it owns) must go
    // before the runtime their workers run on.
    pub lua: Lua,
    pub ctx: BridgeContext,
    pub dispatcher: CallbackDispatcher,
    pub rt: tokio::runtime::Runtime,
}

impl Harness {
    pub fn new() -> Self {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let ctx = BridgeContext::new(rt.handle().clone(), BridgeSettings::default());
        let lua = Lua::new();
        ctx.install(&lua);
        ModuleSettings {
            watch_interval: Duration::from_millis(20),
            ..Default::default()
        }
        .install(&lua);

        for (name, loader) in MODULES {
            let module = loader(&lua).unwrap();
            lua.globals().set(*name, module).unwrap();
        }

        Self {
            lua,
            ctx,
            dispatcher: CallbackDispatcher::new(),
            rt,
        }
    }

    pub fn set<V: mlua::IntoLua>(&self, name: &str, value: V) {
        self.lua.globals().set(name, value).unwrap();
    }

    pub fn exec(&self, source: &str) {
        self.lua.load(source).exec().unwrap();
    }

    pub fn eval<T: FromLuaMulti>(&self, source: &str) -> T {
        self.lua.load(source).eval().unwrap()
    }

    /// Run queued tasks until `done` holds, the queue goes idle, or `timeout`
    /// elapses. Returns the final value of `done`.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut(&Lua) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done(&self.lua) {
                return true;
            }
            match self.ctx.queue().next_task_timeout(Duration::from_millis(20)) {
                Next::Task(task) => task.run(&self.lua, &self.dispatcher).unwrap(),
                Next::Idle | Next::Shutdown => break,
                Next::TimedOut => {}
            }
        }
        done(&self.lua)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.ctx.handles().sweep();
    }
}
