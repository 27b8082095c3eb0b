//! The seam between shell sessions and the protocol that carries them.
//!
//! A [`ShellConnector`] opens a [`ShellTransport`] for a target. The `local`
//! connector ships with the crate; remote protocols (SSH and friends) are
//! registered by the embedder through [`ShellConnectors::register`].

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use mlua::Lua;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::process::Command;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A bidirectional byte stream opened through a transport.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

#[derive(Debug, Clone, Default)]
pub struct ShellTarget {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
}

pub trait ShellTransport: Send + Sync {
    fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, io::Result<ExecOutput>>;

    fn upload<'a>(&'a self, data: &'a [u8], remote_path: &'a str) -> BoxFuture<'a, io::Result<()>>;

    /// Open a connection to `host:port` as seen from the remote side.
    fn dial<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<Box<dyn DuplexStream>>>;

    /// Tear down the underlying connection. Called once, when the session closes.
    fn disconnect(&self) {}
}

pub trait ShellConnector: Send + Sync {
    fn name(&self) -> &'static str;

    fn connect<'a>(&'a self, target: &'a ShellTarget) -> BoxFuture<'a, io::Result<Arc<dyn ShellTransport>>>;
}

/// The connectors available to one interpreter, keyed by transport name.
#[derive(Clone)]
pub struct ShellConnectors {
    connectors: HashMap<&'static str, Arc<dyn ShellConnector>>,
}

impl ShellConnectors {
    pub fn new() -> Self {
        let mut connectors = Self {
            connectors: HashMap::new(),
        };
        connectors.register(Arc::new(LocalConnector));
        connectors
    }

    pub fn register(&mut self, connector: Arc<dyn ShellConnector>) {
        self.connectors.insert(connector.name(), connector);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ShellConnector>> {
        self.connectors.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.connectors.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Register `connector` for scripts running in `lua`.
    pub fn install(lua: &Lua, connector: Arc<dyn ShellConnector>) {
        let mut connectors = Self::from_lua(lua);
        connectors.register(connector);
        lua.set_app_data(connectors);
    }

    pub fn from_lua(lua: &Lua) -> Self {
        lua.app_data_ref::<ShellConnectors>()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

impl Default for ShellConnectors {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs commands on this machine through `sh -c`.
pub struct LocalConnector;

impl ShellConnector for LocalConnector {
    fn name(&self) -> &'static str {
        "local"
    }

    fn connect<'a>(&'a self, target: &'a ShellTarget) -> BoxFuture<'a, io::Result<Arc<dyn ShellTransport>>> {
        Box::pin(async move {
            let cwd = match &target.cwd {
                Some(cwd) => {
                    let cwd = PathBuf::from(cwd);
                    if !tokio::fs::metadata(&cwd).await?.is_dir() {
                        return Err(io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("{} is not a directory", cwd.display()),
                        ));
                    }
                    Some(cwd)
                }
                None => None,
            };
            Ok(Arc::new(LocalTransport { cwd }) as Arc<dyn ShellTransport>)
        })
    }
}

pub struct LocalTransport {
    cwd: Option<PathBuf>,
}

impl LocalTransport {
    fn resolve(&self, path: &str) -> PathBuf {
        match &self.cwd {
            Some(cwd) => cwd.join(path),
            None => PathBuf::from(path),
        }
    }
}

impl ShellTransport for LocalTransport {
    fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, io::Result<ExecOutput>> {
        Box::pin(async move {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command).stdin(Stdio::null()).kill_on_drop(true);
            if let Some(cwd) = &self.cwd {
                cmd.current_dir(cwd);
            }
            let output = cmd.output().await?;
            Ok(ExecOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                code: output.status.code(),
            })
        })
    }

    fn upload<'a>(&'a self, data: &'a [u8], remote_path: &'a str) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move { tokio::fs::write(self.resolve(remote_path), data).await })
    }

    fn dial<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<Box<dyn DuplexStream>>> {
        Box::pin(async move {
            let stream = TcpStream::connect((host, port)).await?;
            Ok(Box::new(stream) as Box<dyn DuplexStream>)
        })
    }
}
