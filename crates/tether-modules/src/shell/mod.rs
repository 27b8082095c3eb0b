//! `shell`: command sessions and port tunnels.
//!
//! ```lua
//! local shell = require("shell")
//! local s = assert(shell.connect{ host = "localhost", cwd = "/tmp" })
//! local out = assert(s:exec("uname -a"))
//! local t = assert(s:tunnel(0, "127.0.0.1", 5432))
//! print(t:local_port())
//! ```

mod transport;
mod tunnel;

pub use transport::{
    BoxFuture, DuplexStream, ExecOutput, LocalConnector, LocalTransport, ShellConnector,
    ShellConnectors, ShellTarget, ShellTransport,
};
pub use tunnel::ShellTunnel;

use std::sync::{Arc, Mutex, Weak};

use mlua::{AnyUserData, Lua, Table, UserDataMethods, Value};
use tether_bridge::{
    BridgeContext, BridgeError, NativeResource, ResourceHandle, ScriptMethods, ScriptObject,
    error_value, result_pair,
};
use tracing::{debug, info, warn};

use crate::options::Options;
use crate::settings::ModuleSettings;

pub struct ShellSession {
    target: ShellTarget,
    transport_name: &'static str,
    transport: Arc<dyn ShellTransport>,
    tunnels: Mutex<Vec<Weak<ResourceHandle<ShellTunnel>>>>,
}

impl NativeResource for ShellSession {
    const KIND: &'static str = "session";

    fn release(&self) -> Result<(), BridgeError> {
        let tunnels = std::mem::take(&mut *self.tunnels.lock().unwrap_or_else(|e| e.into_inner()));
        for tunnel in tunnels.iter().filter_map(Weak::upgrade) {
            if let Err(e) = tunnel.close() {
                warn!(target: "shell", "Error closing tunnel #{}: {}", tunnel.id(), e);
            }
        }
        self.transport.disconnect();
        debug!(target: "shell", "Disconnected from {} ({})", self.target.host, self.transport_name);
        Ok(())
    }
}

impl ShellSession {
    pub fn connect(
        ctx: &BridgeContext,
        connector: Arc<dyn ShellConnector>,
        target: ShellTarget,
    ) -> Result<Arc<ResourceHandle<ShellSession>>, BridgeError> {
        if target.host.is_empty() {
            return Err(BridgeError::config("connect.host is required"));
        }

        let transport = ctx
            .block_on(connector.connect(&target))
            .map_err(|e| BridgeError::connect(format!("{} ({}): {}", target.host, connector.name(), e)))?;
        info!(target: "shell", "Connected to {} via {}", target.host, connector.name());

        Ok(ResourceHandle::new(
            ctx,
            ShellSession {
                target,
                transport_name: connector.name(),
                transport,
                tunnels: Mutex::new(Vec::new()),
            },
        ))
    }

    pub fn target(&self) -> &ShellTarget {
        &self.target
    }

    pub fn transport(&self) -> Arc<dyn ShellTransport> {
        self.transport.clone()
    }

    pub async fn exec(&self, command: &str) -> Result<ExecOutput, BridgeError> {
        self.transport
            .exec(command)
            .await
            .map_err(|e| BridgeError::operation(format!("exec failed: {e}")))
    }

    pub async fn upload(&self, data: &[u8], remote_path: &str) -> Result<(), BridgeError> {
        self.transport
            .upload(data, remote_path)
            .await
            .map_err(|e| BridgeError::operation(format!("upload to {remote_path} failed: {e}")))
    }

    fn track(&self, tunnel: &Arc<ResourceHandle<ShellTunnel>>) {
        let mut tunnels = self.tunnels.lock().unwrap_or_else(|e| e.into_inner());
        tunnels.retain(|t| t.upgrade().is_some_and(|t| !t.is_closed()));
        tunnels.push(Arc::downgrade(tunnel));
    }
}

/// Open a tunnel on `session` and hand it to the script.
fn open_tunnel(
    lua: &Lua,
    session: &Arc<ResourceHandle<ShellSession>>,
    local_port: u16,
    remote_host: String,
    remote_port: u16,
) -> mlua::Result<(Value, Value)> {
    let opened = session.native().and_then(|native| {
        let tunnel = ShellTunnel::open(session.context(), session, local_port, remote_host, remote_port)?;
        native.track(&tunnel);
        Ok(tunnel)
    });

    match opened {
        Ok(tunnel) => {
            let ud = ScriptObject::new(tunnel).into_userdata(lua)?;
            Ok((Value::UserData(ud), Value::Nil))
        }
        Err(e) => result_pair::<Value>(lua, Err(e)),
    }
}

fn exec_table(lua: &Lua, output: ExecOutput) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set("stdout", output.stdout)?;
    table.set("stderr", output.stderr)?;
    table.set("code", output.code)?;
    table.set("success", output.code == Some(0))?;
    Ok(table)
}

impl ScriptMethods for ShellSession {
    fn add_methods<M: UserDataMethods<ScriptObject<Self>>>(methods: &mut M) {
        methods.add_method("exec", |lua, this, command: String| {
            let result = this
                .native()
                .and_then(|s| this.handle().context().block_on(s.exec(&command)));
            match result {
                Ok(output) => Ok((Value::Table(exec_table(lua, output)?), Value::Nil)),
                Err(e) => result_pair::<Value>(lua, Err(e)),
            }
        });
        methods.add_method("upload", |lua, this, (data, remote_path): (mlua::String, String)| {
            let result = this.native().and_then(|s| {
                this.handle()
                    .context()
                    .block_on(s.upload(&data.as_bytes(), &remote_path))
            });
            error_value(lua, result)
        });
        methods.add_method(
            "tunnel",
            |lua, this, (local_port, remote_host, remote_port): (u16, String, u16)| {
                open_tunnel(lua, this.handle(), local_port, remote_host, remote_port)
            },
        );
        methods.add_method("host", |lua, this, ()| {
            result_pair(lua, this.native().map(|s| s.target().host.clone()))
        });
    }
}

fn connect(lua: &Lua, table: Table) -> mlua::Result<(Value, Value)> {
    let connected = (|| {
        let ctx = BridgeContext::from_lua(lua)?;
        let opts = Options::new(&table, "connect");
        let transport = opts
            .string("transport")?
            .unwrap_or_else(|| ModuleSettings::from_lua(lua).default_transport);
        let connector = ShellConnectors::from_lua(lua)
            .get(&transport)
            .ok_or_else(|| BridgeError::config(format!("unknown shell transport '{transport}'")))?;
        let target = ShellTarget {
            host: opts.string("host")?.unwrap_or_else(|| "localhost".to_string()),
            port: opts.port("port")?,
            user: opts.string("user")?,
            cwd: opts.string("cwd")?,
        };
        ShellSession::connect(&ctx, connector, target)
    })();

    match connected {
        Ok(handle) => {
            let ud = ScriptObject::new(handle).into_userdata(lua)?;
            Ok((Value::UserData(ud), Value::Nil))
        }
        Err(e) => result_pair::<Value>(lua, Err(e)),
    }
}

fn tunnel(
    lua: &Lua,
    (session, local_port, remote_host, remote_port): (AnyUserData, u16, String, u16),
) -> mlua::Result<(Value, Value)> {
    let session = session.borrow::<ScriptObject<ShellSession>>()?;
    open_tunnel(lua, session.handle(), local_port, remote_host, remote_port)
}

pub fn load(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set("connect", lua.create_function(connect)?)?;
    module.set("tunnel", lua.create_function(tunnel)?)?;
    Ok(module)
}
