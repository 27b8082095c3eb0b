//! The generic shape every native handle shares.
//!
//! A [`ResourceHandle`] owns one native resource, the stop signal for the
//! workers serving it, and (optionally) an active-source registration in the
//! interpreter's event queue. Closing is idempotent and runs its teardown
//! exactly once no matter how many threads race to close.

use std::sync::{Arc, Mutex, Weak};

use mlua::{IntoLuaMulti, Lua};
use tracing::{debug, trace, warn};

use crate::context::BridgeContext;
use crate::dispatch::CallbackSlot;
use crate::error::BridgeError;
use crate::guard::LifecycleGuard;
use crate::queue::{SourceToken, Task};
use crate::shutdown::{ShutdownListener, ShutdownSignal};
use crate::table::{HandleId, ManagedHandle};

/// The native side of a handle.
pub trait NativeResource: Send + Sync + 'static {
    /// Name used in errors and logs, e.g. `"watcher"`.
    const KIND: &'static str;

    /// Free the resource. Called once, after the handle's workers stopped.
    fn release(&self) -> Result<(), BridgeError> {
        Ok(())
    }
}

pub struct ResourceHandle<T: NativeResource> {
    id: HandleId,
    guard: LifecycleGuard<Arc<T>>,
    shutdown: ShutdownSignal,
    source: Mutex<Option<SourceToken>>,
    ctx: BridgeContext,
}

impl<T: NativeResource> ResourceHandle<T> {
    /// Wrap a handle that never produces events.
    pub fn new(ctx: &BridgeContext, native: T) -> Arc<Self> {
        Self::build(ctx, native, false)
    }

    /// Wrap a handle that produces events. The interpreter's run loop keeps
    /// going until it is closed (or calls [`release_source`](Self::release_source)).
    pub fn new_source(ctx: &BridgeContext, native: T) -> Arc<Self> {
        Self::build(ctx, native, true)
    }

    fn build(ctx: &BridgeContext, native: T, produces_events: bool) -> Arc<Self> {
        let id = ctx.handles().allocate_id();
        let source = produces_events.then(|| ctx.queue().add_source(format!("{}#{}", T::KIND, id)));

        let handle = Arc::new(Self {
            id,
            guard: LifecycleGuard::new(Arc::new(native)),
            shutdown: ShutdownSignal::new(),
            source: Mutex::new(source),
            ctx: ctx.clone(),
        });

        let weak: Weak<dyn ManagedHandle> = Arc::downgrade(&handle) as Weak<dyn ManagedHandle>;
        ctx.handles().insert(id, weak);
        debug!(target: "bridge", "Opened {} #{}", T::KIND, id);
        handle
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn context(&self) -> &BridgeContext {
        &self.ctx
    }

    /// The native resource, or [`BridgeError::Closed`].
    pub fn native(&self) -> Result<Arc<T>, BridgeError> {
        self.guard.snapshot().ok_or_else(|| BridgeError::closed(T::KIND))
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }

    /// Register a background worker. `close()` waits for it to drop the
    /// listener before releasing the native resource.
    pub fn listener(&self) -> ShutdownListener {
        self.shutdown.listener()
    }

    /// Queue interpreter-thread work for this handle. Returns false (and
    /// drops the task) once the handle is closed.
    pub fn queue_task(&self, task: Task) -> bool {
        self.guard
            .with(|_| self.ctx.queue().queue_task(task))
            .is_some()
    }

    /// Queue a call to the callback in `slot`.
    ///
    /// The arguments are built by `marshal` on the interpreter thread. When
    /// the task runs after the handle was closed, or with no callback set,
    /// it does nothing.
    pub fn emit<A, F>(self: &Arc<Self>, label: &'static str, slot: &Arc<CallbackSlot>, marshal: F) -> bool
    where
        A: IntoLuaMulti,
        F: FnOnce(&Lua) -> mlua::Result<A> + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        let slot = slot.clone();
        let task = Task::new(label, move |lua, dispatcher| {
            if !weak.upgrade().is_some_and(|h| !h.is_closed()) {
                trace!(target: "bridge", "Dropping {} for closed {}", label, T::KIND);
                return Ok(());
            }
            let Some(callback) = slot.function(lua).map_err(|e| BridgeError::Runtime(e.to_string()))? else {
                return Ok(());
            };
            let args = marshal(lua).map_err(|e| BridgeError::operation(format!("{label}: {e}")))?;
            dispatcher.invoke(&callback, args).map(|_| ())
        });
        self.queue_task(task)
    }

    /// Give up the active-source registration while staying open.
    ///
    /// Used by handles whose event stream has a natural end, like a process
    /// after its exit notification.
    pub fn release_source(&self) {
        let token = self.source.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(token) = token {
            self.ctx.queue().remove_source(token);
        }
    }

    /// Close the handle: stop workers, release the resource, drop the
    /// source registration. Safe to call any number of times.
    pub fn close(&self) -> Result<(), BridgeError> {
        self.close_with(true)
    }

    /// Close from inside one of this handle's own workers, after the native
    /// side failed for good. Does not wait for workers.
    pub fn close_lost(&self, reason: &str) {
        if self.is_closed() {
            return;
        }
        warn!(target: "bridge", "{} #{} lost: {}", T::KIND, self.id, reason);
        if let Err(e) = self.close_with(false) {
            warn!(target: "bridge", "Error releasing {} #{}: {}", T::KIND, self.id, e);
        }
    }

    fn close_with(&self, wait: bool) -> Result<(), BridgeError> {
        let Some(native) = self.guard.close() else {
            return Ok(());
        };

        if wait {
            let timeout = self.ctx.settings().close_timeout;
            if !self.shutdown.trigger_and_wait(timeout) {
                warn!(
                    target: "bridge",
                    "{} #{} still had {} worker(s) after {:?}",
                    T::KIND,
                    self.id,
                    self.shutdown.live_workers(),
                    timeout
                );
            }
        } else {
            self.shutdown.trigger();
        }

        let result = native.release();
        self.release_source();
        self.ctx.handles().forget(self.id);
        debug!(target: "bridge", "Closed {} #{}", T::KIND, self.id);
        result
    }
}

impl<T: NativeResource> ManagedHandle for ResourceHandle<T> {
    fn id(&self) -> HandleId {
        self.id
    }

    fn kind(&self) -> &'static str {
        T::KIND
    }

    fn close(&self) -> Result<(), BridgeError> {
        ResourceHandle::close(self)
    }

    fn is_closed(&self) -> bool {
        ResourceHandle::is_closed(self)
    }
}

impl<T: NativeResource> Drop for ResourceHandle<T> {
    fn drop(&mut self) {
        if !self.guard.is_closed() {
            let _ = self.close_with(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BridgeSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Counter {
        releases: Arc<AtomicUsize>,
    }

    impl NativeResource for Counter {
        const KIND: &'static str = "counter";

        fn release(&self) -> Result<(), BridgeError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn context(rt: &tokio::runtime::Runtime) -> BridgeContext {
        BridgeContext::new(rt.handle().clone(), BridgeSettings::default())
    }

    #[test]
    fn test_close_is_idempotent() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let ctx = context(&rt);
        let releases = Arc::new(AtomicUsize::new(0));
        let handle = ResourceHandle::new_source(&ctx, Counter { releases: releases.clone() });
        assert_eq!(ctx.queue().active_sources(), 1);

        handle.close().unwrap();
        handle.close().unwrap();
        handle.close().unwrap();

        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.queue().active_sources(), 0);
        assert!(handle.native().unwrap_err().is_closed());
    }

    #[test]
    fn test_close_waits_for_workers() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let ctx = context(&rt);
        let handle = ResourceHandle::new(&ctx, Counter { releases: Arc::default() });
        let stopped = Arc::new(AtomicUsize::new(0));

        let mut listener = handle.listener();
        let flag = stopped.clone();
        rt.spawn(async move {
            listener.cancelled().await;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            flag.store(1, Ordering::SeqCst);
        });

        handle.close().unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_source_keeps_handle_open() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let ctx = context(&rt);
        let handle = ResourceHandle::new_source(&ctx, Counter { releases: Arc::default() });

        handle.release_source();
        assert_eq!(ctx.queue().active_sources(), 0);
        assert!(!handle.is_closed());

        // close() must not remove the source a second time
        handle.close().unwrap();
        assert_eq!(ctx.queue().active_sources(), 0);
    }

    #[test]
    fn test_tasks_refused_after_close() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let ctx = context(&rt);
        let handle = ResourceHandle::new(&ctx, Counter { releases: Arc::default() });

        assert!(handle.queue_task(Task::new("before", |_, _| Ok(()))));
        handle.close().unwrap();
        assert!(!handle.queue_task(Task::new("after", |_, _| Ok(()))));
        assert_eq!(ctx.queue().pending(), 1);
    }

    #[test]
    fn test_drop_closes_and_forgets() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let ctx = context(&rt);
        let releases = Arc::new(AtomicUsize::new(0));
        let handle = ResourceHandle::new_source(&ctx, Counter { releases: releases.clone() });
        assert_eq!(ctx.handles().len(), 1);

        drop(handle);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.queue().active_sources(), 0);
        assert!(ctx.handles().is_empty());
    }
}
