//! Liveness tracking for every handle an interpreter created.
//!
//! Lua's garbage collector eventually finalizes unreachable handles, but it
//! gives no timing guarantee. The table lets the host close whatever a script
//! forgot about when the interpreter shuts down.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, Weak};

use tracing::{debug, warn};

use crate::error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type-erased view of a handle, enough to close it.
pub trait ManagedHandle: Send + Sync {
    fn id(&self) -> HandleId;
    fn kind(&self) -> &'static str;
    fn close(&self) -> Result<(), BridgeError>;
    fn is_closed(&self) -> bool;
}

pub struct HandleTable {
    entries: Mutex<HashMap<HandleId, Weak<dyn ManagedHandle>>>,
    next_id: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<HandleId, Weak<dyn ManagedHandle>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn allocate_id(&self) -> HandleId {
        HandleId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn insert(&self, id: HandleId, handle: Weak<dyn ManagedHandle>) {
        self.lock().insert(id, handle);
    }

    pub fn forget(&self, id: HandleId) {
        self.lock().remove(&id);
    }

    /// Handles that are registered and not yet closed.
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|h| h.upgrade().is_some_and(|h| !h.is_closed()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every handle still open. Returns how many were closed.
    pub fn sweep(&self) -> usize {
        // Collect first: close() re-enters the table through forget().
        let live: Vec<_> = self.lock().drain().filter_map(|(_, h)| h.upgrade()).collect();

        let mut closed = 0;
        for handle in live {
            if handle.is_closed() {
                continue;
            }
            warn!(
                target: "bridge",
                "Closing leaked {} handle #{}",
                handle.kind(),
                handle.id()
            );
            if let Err(e) = handle.close() {
                warn!(target: "bridge", "Error closing {} #{}: {}", handle.kind(), handle.id(), e);
            }
            closed += 1;
        }

        if closed > 0 {
            debug!(target: "bridge", "Swept {} open handle(s)", closed);
        }
        closed
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
