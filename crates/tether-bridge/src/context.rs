use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mlua::Lua;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::BridgeError;
use crate::queue::EventQueue;
use crate::table::HandleTable;

/// Default bound on how long `close()` waits for a handle's workers.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Tunables shared by every handle of one interpreter.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub close_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

struct ContextInner {
    queue: Arc<EventQueue>,
    handles: Arc<HandleTable>,
    runtime: Handle,
    settings: BridgeSettings,
}

/// Everything a native module needs to create handles for one interpreter.
///
/// Stored as Lua app data so module functions can find it.
#[derive(Clone)]
pub struct BridgeContext {
    inner: Arc<ContextInner>,
}

impl BridgeContext {
    pub fn new(runtime: Handle, settings: BridgeSettings) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                queue: Arc::new(EventQueue::new()),
                handles: Arc::new(HandleTable::new()),
                runtime,
                settings,
            }),
        }
    }

    /// Make this context reachable from native functions called by `lua`.
    pub fn install(&self, lua: &Lua) {
        lua.set_app_data(self.clone());
    }

    pub fn from_lua(lua: &Lua) -> Result<Self, BridgeError> {
        lua.app_data_ref::<BridgeContext>()
            .map(|ctx| ctx.clone())
            .ok_or_else(|| BridgeError::Runtime("bridge context not installed".to_string()))
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.inner.queue
    }

    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.inner.handles
    }

    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.inner.settings
    }

    /// Run a future to completion from the interpreter thread.
    ///
    /// Must not be called from inside the runtime's own worker threads.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.inner.runtime.block_on(future)
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.runtime.spawn(future)
    }
}
