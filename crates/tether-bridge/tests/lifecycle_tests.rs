//! Concurrency tests for handle close and event-queue accounting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use mlua::{Lua, UserDataMethods};
use tether_bridge::{
    BridgeContext, BridgeError, BridgeSettings, CallbackDispatcher, CallbackSlot, NativeResource,
    ResourceHandle, ScriptMethods, ScriptObject, Task, result_pair,
};

struct Socket {
    releases: Arc<AtomicUsize>,
    sends: AtomicUsize,
}

impl Socket {
    fn send(&self) {
        self.sends.fetch_add(1, Ordering::SeqCst);
    }
}

impl NativeResource for Socket {
    const KIND: &'static str = "socket";

    fn release(&self) -> Result<(), BridgeError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl ScriptMethods for Socket {
    fn add_methods<M: UserDataMethods<ScriptObject<Self>>>(methods: &mut M) {
        methods.add_method("send", |lua, this, ()| {
            let sent = this.native().map(|socket| {
                socket.send();
                socket.sends.load(Ordering::SeqCst)
            });
            result_pair(lua, sent)
        });
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

#[test]
fn test_operations_racing_close_release_exactly_once() {
    let rt = runtime();
    let ctx = BridgeContext::new(rt.handle().clone(), BridgeSettings::default());
    let releases = Arc::new(AtomicUsize::new(0));
    let handle = ResourceHandle::new_source(
        &ctx,
        Socket {
            releases: releases.clone(),
            sends: AtomicUsize::new(0),
        },
    );

    let threads = 1000;
    let barrier = Arc::new(Barrier::new(threads));
    let ok = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..threads)
        .map(|i| {
            let handle = handle.clone();
            let barrier = barrier.clone();
            let ok = ok.clone();
            let closed = closed.clone();
            thread::spawn(move || {
                barrier.wait();
                if i % 2 == 0 {
                    match handle.native() {
                        Ok(socket) => {
                            socket.send();
                            ok.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => {
                            assert!(e.is_closed());
                            closed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                } else {
                    handle.close().unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(releases.load(Ordering::SeqCst), 1);
    assert_eq!(ok.load(Ordering::SeqCst) + closed.load(Ordering::SeqCst), threads / 2);
    assert_eq!(ctx.queue().active_sources(), 0);
    assert!(handle.is_closed());
}

#[test]
fn test_script_calls_racing_close_see_value_or_closed() {
    let rt = runtime();
    let ctx = BridgeContext::new(rt.handle().clone(), BridgeSettings::default());
    let releases = Arc::new(AtomicUsize::new(0));
    let handle = ResourceHandle::new_source(
        &ctx,
        Socket {
            releases: releases.clone(),
            sends: AtomicUsize::new(0),
        },
    );

    let lua = Lua::new();
    let socket = ScriptObject::new(handle.clone()).into_userdata(&lua).unwrap();
    lua.globals().set("sock", socket).unwrap();

    // The interpreter thread joins the barrier too.
    let threads = 999;
    let barrier = Arc::new(Barrier::new(threads + 1));
    let workers: Vec<_> = (0..threads)
        .map(|i| {
            let handle = handle.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                if i % 3 == 0 {
                    handle.close().unwrap();
                } else if let Ok(socket) = handle.native() {
                    socket.send();
                }
            })
        })
        .collect();

    barrier.wait();
    let (ok, closed, other, reopened): (u32, u32, u32, bool) = lua
        .load(
            r#"
            local ok, closed, other = 0, 0, 0
            local saw_closed, reopened = false, false
            for _ = 1, 20000 do
                local sent, err = sock:send()
                if err == nil and type(sent) == "number" then
                    ok = ok + 1
                    reopened = reopened or saw_closed
                elseif err == "socket handle is closed" and sent == nil then
                    closed = closed + 1
                    saw_closed = true
                else
                    other = other + 1
                end
            end
            return ok, closed, other, reopened
            "#,
        )
        .eval()
        .unwrap();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(ok + closed, 20000);
    assert_eq!(other, 0);
    assert!(!reopened);
    assert_eq!(releases.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.queue().active_sources(), 0);

    let (sent, err): (mlua::Value, String) = lua.load("return sock:send()").eval().unwrap();
    assert!(sent.is_nil());
    assert_eq!(err, "socket handle is closed");
    let closed_from_lua: bool = lua.load("return sock:is_closed()").eval().unwrap();
    assert!(closed_from_lua);
}

#[test]
fn test_sweep_closes_leaked_handles() {
    let rt = runtime();
    let ctx = BridgeContext::new(rt.handle().clone(), BridgeSettings::default());
    let releases = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            ResourceHandle::new_source(
                &ctx,
                Socket {
                    releases: releases.clone(),
                    sends: AtomicUsize::new(0),
                },
            )
        })
        .collect();
    handles[0].close().unwrap();
    assert_eq!(ctx.queue().active_sources(), 2);

    assert_eq!(ctx.handles().sweep(), 2);
    assert_eq!(releases.load(Ordering::SeqCst), 3);
    assert_eq!(ctx.queue().active_sources(), 0);
    assert!(handles.iter().all(|h| h.is_closed()));
}

#[test]
fn test_events_emitted_by_worker_reach_callback_in_order() {
    let rt = runtime();
    let ctx = BridgeContext::new(rt.handle().clone(), BridgeSettings::default());
    let lua = Lua::new();
    let dispatcher = CallbackDispatcher::new();

    let handle = ResourceHandle::new_source(
        &ctx,
        Socket {
            releases: Arc::default(),
            sends: AtomicUsize::new(0),
        },
    );
    let slot = Arc::new(CallbackSlot::new());
    let seen: mlua::Table = lua.create_table().unwrap();
    lua.globals().set("seen", seen.clone()).unwrap();
    let callback: mlua::Function = lua
        .load("return function(n) seen[#seen + 1] = n end")
        .eval()
        .unwrap();
    slot.set(&lua, Some(callback)).unwrap();

    let producer = {
        let handle = handle.clone();
        let slot = slot.clone();
        thread::spawn(move || {
            for n in 0..50i64 {
                handle.emit("message", &slot, move |_| Ok(n));
            }
            handle.release_source();
        })
    };

    let ran = ctx.queue().drain(&lua, &dispatcher).unwrap();
    producer.join().unwrap();

    assert_eq!(ran, 50);
    let values: Vec<i64> = seen.sequence_values().collect::<mlua::Result<_>>().unwrap();
    assert_eq!(values, (0..50).collect::<Vec<_>>());
    handle.close().unwrap();
}

#[test]
fn test_events_queued_before_close_are_dropped_at_dispatch() {
    let rt = runtime();
    let ctx = BridgeContext::new(rt.handle().clone(), BridgeSettings::default());
    let lua = Lua::new();
    let dispatcher = CallbackDispatcher::new();

    let handle = ResourceHandle::new_source(
        &ctx,
        Socket {
            releases: Arc::default(),
            sends: AtomicUsize::new(0),
        },
    );
    let slot = Arc::new(CallbackSlot::new());
    let callback: mlua::Function = lua
        .load("return function() error('must not run') end")
        .eval()
        .unwrap();
    slot.set(&lua, Some(callback)).unwrap();

    assert!(handle.emit("message", &slot, |_| Ok(())));
    handle.close().unwrap();

    // The task is still queued but does nothing once dispatched.
    assert_eq!(ctx.queue().pending(), 1);
    assert_eq!(ctx.queue().run_pending(&lua, &dispatcher).unwrap(), 1);
    assert_eq!(dispatcher.failures(), 0);
}

#[test]
fn test_idle_queue_returns_once_last_source_closes() {
    let rt = runtime();
    let ctx = BridgeContext::new(rt.handle().clone(), BridgeSettings::default());
    let lua = Lua::new();
    let dispatcher = CallbackDispatcher::new();

    let handle = ResourceHandle::new_source(
        &ctx,
        Socket {
            releases: Arc::default(),
            sends: AtomicUsize::new(0),
        },
    );

    let closer = {
        let handle = handle.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            assert!(handle.queue_task(Task::new("last", |_, _| Ok(()))));
            handle.close().unwrap();
        })
    };

    assert_eq!(ctx.queue().drain(&lua, &dispatcher).unwrap(), 1);
    closer.join().unwrap();
}
