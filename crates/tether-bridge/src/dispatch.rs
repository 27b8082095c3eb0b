use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use mlua::{Function, IntoLuaMulti, Lua, MultiValue, RegistryKey};
use tracing::error;

use crate::error::BridgeError;

/// Invokes script callbacks on the interpreter thread.
///
/// A callback that raises (or a native function that panics underneath it)
/// is logged and turned into [`BridgeError::Callback`]. Nothing propagates
/// back to the worker that produced the event; it has already moved on.
pub struct CallbackDispatcher {
    strict: bool,
    failures: AtomicU64,
}

impl CallbackDispatcher {
    /// Log-and-continue dispatcher.
    pub fn new() -> Self {
        Self::with_strict(false)
    }

    /// Dispatcher whose callback errors stop the run loop.
    pub fn strict() -> Self {
        Self::with_strict(true)
    }

    pub fn with_strict(strict: bool) -> Self {
        Self {
            strict,
            failures: AtomicU64::new(0),
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Number of invocations that raised so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn invoke(
        &self,
        callback: &Function,
        args: impl IntoLuaMulti,
    ) -> Result<MultiValue, BridgeError> {
        let result = catch_unwind(AssertUnwindSafe(|| callback.call::<MultiValue>(args)));

        let message = match result {
            Ok(Ok(values)) => return Ok(values),
            Ok(Err(err)) => {
                error!(target: "bridge", "Script callback raised: {}", err);
                err.to_string()
            }
            Err(panic) => {
                let message = panic_message(&panic);
                error!(target: "bridge", "Script callback panicked: {}", message);
                message
            }
        };

        self.failures.fetch_add(1, Ordering::Relaxed);
        Err(BridgeError::Callback(message))
    }
}

impl Default for CallbackDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A script callback registered on a handle.
///
/// The function lives in the Lua registry; the slot only holds the key, so it
/// can be shared with worker threads and read back on the interpreter thread.
#[derive(Default)]
pub struct CallbackSlot {
    key: Mutex<Option<Arc<RegistryKey>>>,
}

impl CallbackSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the callback. `None` unregisters it.
    pub fn set(&self, lua: &Lua, callback: Option<Function>) -> mlua::Result<()> {
        let key = match callback {
            Some(f) => Some(Arc::new(lua.create_registry_value(f)?)),
            None => None,
        };
        *self.key.lock().unwrap_or_else(|e| e.into_inner()) = key;
        Ok(())
    }

    pub fn is_set(&self) -> bool {
        self.key.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    pub fn clear(&self) {
        self.key.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Resolve the callback. Interpreter thread only.
    pub fn function(&self, lua: &Lua) -> mlua::Result<Option<Function>> {
        let key = self.key.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match key {
            Some(key) => lua.registry_value::<Function>(&key).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_returns_results() {
        let lua = Lua::new();
        let add: Function = lua.load("return function(a, b) return a + b end").eval().unwrap();
        let dispatcher = CallbackDispatcher::new();

        let values = dispatcher.invoke(&add, (2, 3)).unwrap();
        assert!(matches!(values.into_iter().next(), Some(mlua::Value::Integer(5))));
        assert_eq!(dispatcher.failures(), 0);
    }

    #[test]
    fn test_invoke_catches_script_error() {
        let lua = Lua::new();
        let raises: Function = lua
            .load("return function() error('handler exploded') end")
            .eval()
            .unwrap();
        let dispatcher = CallbackDispatcher::new();

        let err = dispatcher.invoke(&raises, ()).unwrap_err();
        assert!(matches!(err, BridgeError::Callback(ref m) if m.contains("handler exploded")));
        assert_eq!(dispatcher.failures(), 1);
    }

    #[test]
    fn test_slot_round_trip_and_clear() {
        let lua = Lua::new();
        let slot = CallbackSlot::new();
        assert!(slot.function(&lua).unwrap().is_none());

        let f: Function = lua.load("return function() return 42 end").eval().unwrap();
        slot.set(&lua, Some(f)).unwrap();
        assert!(slot.is_set());

        let f = slot.function(&lua).unwrap().unwrap();
        assert_eq!(f.call::<i64>(()).unwrap(), 42);

        slot.clear();
        assert!(!slot.is_set());
    }
}
