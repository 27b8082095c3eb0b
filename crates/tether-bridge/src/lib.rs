//! Plumbing shared by every native module exposed to Lua scripts.
//!
//! Native resources (watchers, processes, shell sessions) run their own
//! workers on a tokio runtime. Everything a script observes goes through one
//! [`EventQueue`] per interpreter and is run on the interpreter thread by the
//! host's run loop.

pub mod context;
pub mod dispatch;
pub mod error;
pub mod guard;
pub mod handle;
pub mod queue;
pub mod script;
pub mod shutdown;
pub mod table;

pub use context::{BridgeContext, BridgeSettings, DEFAULT_CLOSE_TIMEOUT};
pub use dispatch::{CallbackDispatcher, CallbackSlot};
pub use error::BridgeError;
pub use guard::LifecycleGuard;
pub use handle::{NativeResource, ResourceHandle};
pub use queue::{EventQueue, Next, SourceToken, Task};
pub use script::{ScriptMethods, ScriptObject, error_value, result_pair};
pub use shutdown::{ShutdownListener, ShutdownSignal};
pub use table::{HandleId, HandleTable, ManagedHandle};
