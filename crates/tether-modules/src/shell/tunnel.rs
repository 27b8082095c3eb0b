//! Local port forwarding through a shell session.
//!
//! The accept worker owns the listener. Each accepted connection is dialed
//! through the parent session and piped in both directions until either side
//! hangs up or the tunnel closes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use mlua::{Function, UserDataMethods, Value};
use tether_bridge::{
    BridgeContext, BridgeError, CallbackSlot, NativeResource, ResourceHandle, ScriptMethods,
    ScriptObject, ShutdownListener, error_value, result_pair,
};
use tokio::io::{self, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::ShellSession;

/// Back-off after a failed `accept()` (e.g. out of file descriptors).
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

pub struct ShellTunnel {
    local_addr: SocketAddr,
    remote_host: String,
    remote_port: u16,
    live: Arc<AtomicUsize>,
    on_accept: Arc<CallbackSlot>,
}

impl NativeResource for ShellTunnel {
    const KIND: &'static str = "tunnel";
}

impl ShellTunnel {
    /// Bind `127.0.0.1:local_port` and start forwarding to
    /// `remote_host:remote_port` through `session`.
    pub fn open(
        ctx: &BridgeContext,
        session: &Arc<ResourceHandle<ShellSession>>,
        local_port: u16,
        remote_host: String,
        remote_port: u16,
    ) -> Result<Arc<ResourceHandle<ShellTunnel>>, BridgeError> {
        if remote_host.is_empty() {
            return Err(BridgeError::config("tunnel remote host is required"));
        }
        if remote_port == 0 {
            return Err(BridgeError::config("tunnel remote port must be non-zero"));
        }
        // The session must be usable before anything is bound.
        session.native()?;

        let listener = ctx
            .block_on(TcpListener::bind(("127.0.0.1", local_port)))
            .map_err(|e| BridgeError::connect(format!("cannot listen on port {local_port}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BridgeError::connect(format!("cannot listen on port {local_port}: {e}")))?;

        let tunnel = ShellTunnel {
            local_addr,
            remote_host,
            remote_port,
            live: Arc::new(AtomicUsize::new(0)),
            on_accept: Arc::new(CallbackSlot::new()),
        };
        info!(
            target: "tunnel",
            "Forwarding {} -> {}:{}",
            local_addr,
            tunnel.remote_host,
            tunnel.remote_port
        );

        let handle = ResourceHandle::new_source(ctx, tunnel);
        ctx.spawn(accept_loop(
            handle.clone(),
            Arc::downgrade(session),
            listener,
            handle.listener(),
        ));
        Ok(handle)
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn remote(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    /// Connection pairs currently being piped.
    pub fn connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

struct LiveConnection(Arc<AtomicUsize>);

impl LiveConnection {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn accept_loop(
    tunnel: Arc<ResourceHandle<ShellTunnel>>,
    session: Weak<ResourceHandle<ShellSession>>,
    listener: TcpListener,
    mut done: ShutdownListener,
) {
    let Ok(native) = tunnel.native() else {
        return;
    };

    loop {
        let accepted = tokio::select! {
            _ = done.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (socket, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(target: "tunnel", "accept on {} failed: {}", native.local_addr, e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        debug!(target: "tunnel", "Accepted {} on {}", peer, native.local_addr);

        tunnel.emit("tunnel.accept", &native.on_accept, move |_| Ok(peer.to_string()));
        tokio::spawn(pipe_connection(
            session.clone(),
            socket,
            native.remote_host.clone(),
            native.remote_port,
            LiveConnection::new(native.live.clone()),
            done.clone(),
        ));
    }

    drop(listener);
    debug!(target: "tunnel", "Stopped listening on {}", native.local_addr);
}

async fn pipe_connection(
    session: Weak<ResourceHandle<ShellSession>>,
    mut local: TcpStream,
    host: String,
    port: u16,
    _live: LiveConnection,
    mut done: ShutdownListener,
) {
    let transport = match session.upgrade().map(|s| s.native()) {
        Some(Ok(session)) => session.transport(),
        _ => {
            debug!(target: "tunnel", "Session gone; dropping connection for {}:{}", host, port);
            return;
        }
    };

    let dialed = tokio::select! {
        _ = done.cancelled() => return,
        dialed = transport.dial(&host, port) => dialed,
    };
    let remote = match dialed {
        Ok(remote) => remote,
        Err(e) => {
            warn!(target: "tunnel", "Dial {}:{} failed: {}", host, port, e);
            let _ = local.shutdown().await;
            return;
        }
    };

    let (mut local_read, mut local_write) = io::split(local);
    let (mut remote_read, mut remote_write) = io::split(remote);

    tokio::select! {
        _ = done.cancelled() => {}
        result = io::copy(&mut local_read, &mut remote_write) => {
            if let Err(e) = result {
                debug!(target: "tunnel", "local -> {}:{} ended: {}", host, port, e);
            }
        }
        result = io::copy(&mut remote_read, &mut local_write) => {
            if let Err(e) = result {
                debug!(target: "tunnel", "{}:{} -> local ended: {}", host, port, e);
            }
        }
    }
    let _ = local_write.shutdown().await;
    let _ = remote_write.shutdown().await;
}

impl ScriptMethods for ShellTunnel {
    fn add_methods<M: UserDataMethods<ScriptObject<Self>>>(methods: &mut M) {
        methods.add_method("local_port", |lua, this, ()| {
            result_pair(lua, this.native().map(|t| t.local_port()))
        });
        methods.add_method("remote", |lua, this, ()| {
            result_pair(lua, this.native().map(|t| t.remote()))
        });
        methods.add_method("connections", |lua, this, ()| {
            result_pair(lua, this.native().map(|t| t.connections()))
        });
        methods.add_method("on_accept", |lua, this, callback: Option<Function>| {
            match this.native() {
                Ok(t) => {
                    t.on_accept.set(lua, callback)?;
                    Ok(Value::Nil)
                }
                Err(e) => error_value(lua, Err(e)),
            }
        });
    }
}
