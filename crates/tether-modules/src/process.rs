//! `process`: child processes with exit and output callbacks.
//!
//! A spawned process keeps the run loop alive until its exit notification
//! has been queued. `kill()` followed by `wait()` is the usual way to stop
//! one early.

use std::collections::HashMap;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use mlua::{Function, Lua, Table, UserDataMethods, Value};
use tether_bridge::{
    BridgeContext, BridgeError, CallbackSlot, NativeResource, ResourceHandle, ScriptMethods,
    ScriptObject, ShutdownListener, error_value, result_pair,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex as AsyncMutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::options::Options;

/// How long the supervisor waits for output readers after the child exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub success: bool,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            success: status.success(),
            code: status.code(),
            signal,
        }
    }
}

impl ExitInfo {
    fn to_table(self, lua: &Lua) -> mlua::Result<Table> {
        let table = lua.create_table()?;
        table.set("success", self.success)?;
        table.set("code", self.code)?;
        table.set("signal", self.signal)?;
        Ok(table)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpawnConfig {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub stdin: bool,
}

impl SpawnConfig {
    fn from_table(table: &Table) -> Result<Self, BridgeError> {
        let opts = Options::new(table, "spawn");
        Ok(Self {
            command: opts.required_string("command")?,
            args: opts.strings("args")?,
            cwd: opts.string("cwd")?,
            env: opts.string_map("env")?,
            stdin: opts.boolean("stdin")?.unwrap_or(false),
        })
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args).envs(&self.env).kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

pub struct ChildProcess {
    pid: Option<u32>,
    command: String,
    stdin: AsyncMutex<Option<ChildStdin>>,
    kill: Notify,
    status: watch::Receiver<Option<ExitInfo>>,
    on_exit: Arc<CallbackSlot>,
    on_output: Arc<CallbackSlot>,
}

impl NativeResource for ChildProcess {
    const KIND: &'static str = "process";
}

impl ChildProcess {
    pub fn spawn(
        ctx: &BridgeContext,
        config: SpawnConfig,
        on_exit: Arc<CallbackSlot>,
        on_output: Arc<CallbackSlot>,
    ) -> Result<Arc<ResourceHandle<ChildProcess>>, BridgeError> {
        let mut cmd = config.build_command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if config.stdin { Stdio::piped() } else { Stdio::null() });

        // Child::spawn registers with the runtime's reaper, so it needs the runtime entered.
        let mut child = {
            let _enter = ctx.runtime().enter();
            cmd.spawn()
                .map_err(|e| BridgeError::connect(format!("failed to spawn '{}': {}", config.command, e)))?
        };

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (status_tx, status_rx) = watch::channel(None);

        let process = ChildProcess {
            pid,
            command: config.command,
            stdin: AsyncMutex::new(child.stdin.take()),
            kill: Notify::new(),
            status: status_rx,
            on_exit,
            on_output,
        };
        debug!(target: "process", "Spawned '{}' (pid {:?})", process.command, pid);

        let handle = ResourceHandle::new_source(ctx, process);
        let readers = [
            stdout.map(|out| ctx.spawn(read_lines(handle.clone(), "stdout", out, handle.listener()))),
            stderr.map(|err| ctx.spawn(read_lines(handle.clone(), "stderr", err, handle.listener()))),
        ];
        ctx.spawn(supervise(handle.clone(), child, status_tx, readers, handle.listener()));
        Ok(handle)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit information, once the process has exited.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.status.borrow()
    }

    /// Ask the supervisor to kill the child. Killing an exited process is a no-op.
    pub fn kill(&self) {
        self.kill.notify_one();
    }

    /// Wait for the child to exit, optionally bounded.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<ExitInfo, BridgeError> {
        let mut status = self.status.clone();
        let exited = async {
            status
                .wait_for(|s| s.is_some())
                .await
                .ok()
                .and_then(|s| *s)
        };

        let info = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, exited)
                .await
                .map_err(|_| BridgeError::operation("timed out waiting for process"))?,
            None => exited.await,
        };
        info.ok_or_else(|| BridgeError::operation("process was stopped before it exited"))
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), BridgeError> {
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin
            .as_mut()
            .ok_or_else(|| BridgeError::operation("stdin is not open (spawn with stdin = true)"))?;
        pipe.write_all(data)
            .await
            .map_err(|e| BridgeError::operation(format!("write to stdin failed: {e}")))?;
        pipe.flush()
            .await
            .map_err(|e| BridgeError::operation(format!("write to stdin failed: {e}")))
    }

    pub async fn close_stdin(&self) {
        self.stdin.lock().await.take();
    }
}

async fn supervise(
    handle: Arc<ResourceHandle<ChildProcess>>,
    mut child: Child,
    status_tx: watch::Sender<Option<ExitInfo>>,
    readers: [Option<JoinHandle<()>>; 2],
    mut done: ShutdownListener,
) {
    let Ok(process) = handle.native() else {
        let _ = child.start_kill();
        return;
    };

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = process.kill.notified() => {
                if let Err(e) = child.start_kill() {
                    debug!(target: "process", "kill {:?}: {}", process.pid, e);
                }
            }
            _ = done.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                debug!(target: "process", "Stopped '{}' on close", process.command);
                return;
            }
        }
    };

    report_exit(&handle, &process, status, status_tx, readers).await;
}

/// Publish how the child ended and give up the event source. A failed wait
/// still releases the source; waiters then see the process as stopped.
async fn report_exit(
    handle: &Arc<ResourceHandle<ChildProcess>>,
    process: &ChildProcess,
    status: io::Result<ExitStatus>,
    status_tx: watch::Sender<Option<ExitInfo>>,
    readers: [Option<JoinHandle<()>>; 2],
) {
    let info = match status {
        Ok(status) => ExitInfo::from(status),
        Err(e) => {
            warn!(target: "process", "Failed to wait for '{}': {}", process.command, e);
            for reader in readers.into_iter().flatten() {
                reader.abort();
            }
            drop(status_tx);
            handle.release_source();
            return;
        }
    };
    info!(
        target: "process",
        "'{}' exited (code {:?}, signal {:?})",
        process.command,
        info.code,
        info.signal
    );

    // Let output readers reach EOF so their lines are queued before the exit event.
    for reader in readers.into_iter().flatten() {
        let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await;
    }

    status_tx.send_replace(Some(info));
    handle.emit("process.exit", &process.on_exit, move |lua| info.to_table(lua));
    handle.release_source();
}

async fn read_lines<R>(
    handle: Arc<ResourceHandle<ChildProcess>>,
    stream: &'static str,
    pipe: R,
    mut done: ShutdownListener,
) where
    R: AsyncRead + Unpin,
{
    let Ok(process) = handle.native() else {
        return;
    };
    let on_output = process.on_output.clone();
    drop(process);

    let mut lines = BufReader::new(pipe).lines();
    loop {
        let line = tokio::select! {
            _ = done.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                handle.emit("process.output", &on_output, move |_| Ok((stream, line)));
            }
            Ok(None) => break,
            Err(e) => {
                debug!(target: "process", "{} reader stopped: {}", stream, e);
                break;
            }
        }
    }
}

/// Output of [`run`].
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit: ExitInfo,
}

/// Run a command to completion and collect its output.
pub async fn run(config: &SpawnConfig, timeout: Option<Duration>) -> Result<RunOutput, BridgeError> {
    let mut cmd = config.build_command();
    cmd.stdin(Stdio::null());

    let output = cmd.output();
    let output = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, output)
            .await
            .map_err(|_| BridgeError::operation(format!("'{}' timed out", config.command)))?,
        None => output.await,
    }
    .map_err(|e| BridgeError::connect(format!("failed to run '{}': {}", config.command, e)))?;

    Ok(RunOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit: ExitInfo::from(output.status),
    })
}

impl ScriptMethods for ChildProcess {
    fn add_methods<M: UserDataMethods<ScriptObject<Self>>>(methods: &mut M) {
        methods.add_method("pid", |lua, this, ()| {
            result_pair(lua, this.native().map(|p| p.pid()))
        });
        methods.add_method("kill", |lua, this, ()| {
            error_value(lua, this.native().map(|p| p.kill()))
        });
        methods.add_method("wait", |lua, this, timeout_ms: Option<u64>| {
            let result = this.native().and_then(|p| {
                let timeout = timeout_ms.map(Duration::from_millis);
                this.handle().context().block_on(p.wait(timeout))
            });
            match result {
                Ok(info) => Ok((Value::Table(info.to_table(lua)?), Value::Nil)),
                Err(e) => result_pair::<Value>(lua, Err(e)),
            }
        });
        methods.add_method("write", |lua, this, data: mlua::String| {
            let result = this
                .native()
                .and_then(|p| this.handle().context().block_on(p.write(&data.as_bytes())));
            error_value(lua, result)
        });
        methods.add_method("close_stdin", |lua, this, ()| {
            let result = this
                .native()
                .map(|p| this.handle().context().block_on(p.close_stdin()));
            error_value(lua, result)
        });
        methods.add_method("on_exit", |lua, this, callback: Option<Function>| {
            match this.native() {
                Ok(p) => {
                    p.on_exit.set(lua, callback)?;
                    Ok(Value::Nil)
                }
                Err(e) => error_value(lua, Err(e)),
            }
        });
        methods.add_method("on_output", |lua, this, callback: Option<Function>| {
            match this.native() {
                Ok(p) => {
                    p.on_output.set(lua, callback)?;
                    Ok(Value::Nil)
                }
                Err(e) => error_value(lua, Err(e)),
            }
        });
    }
}

fn spawn(lua: &Lua, table: Table) -> mlua::Result<(Value, Value)> {
    let on_exit = Arc::new(CallbackSlot::new());
    let on_output = Arc::new(CallbackSlot::new());
    let spawned = (|| {
        let ctx = BridgeContext::from_lua(lua)?;
        let config = SpawnConfig::from_table(&table)?;
        let opts = Options::new(&table, "spawn");
        let runtime_err = |e: mlua::Error| BridgeError::Runtime(e.to_string());
        on_exit.set(lua, opts.function("on_exit")?).map_err(runtime_err)?;
        on_output.set(lua, opts.function("on_output")?).map_err(runtime_err)?;
        ChildProcess::spawn(&ctx, config, on_exit.clone(), on_output.clone())
    })();

    match spawned {
        Ok(handle) => {
            let ud = ScriptObject::new(handle).into_userdata(lua)?;
            Ok((Value::UserData(ud), Value::Nil))
        }
        Err(e) => result_pair::<Value>(lua, Err(e)),
    }
}

fn run_blocking(lua: &Lua, table: Table) -> mlua::Result<(Value, Value)> {
    let result = (|| {
        let ctx = BridgeContext::from_lua(lua)?;
        let config = SpawnConfig::from_table(&table)?;
        let timeout = Options::new(&table, "run")
            .integer("timeout_ms")?
            .map(Duration::from_millis);
        ctx.block_on(run(&config, timeout))
    })();

    match result {
        Ok(output) => {
            let table = output.exit.to_table(lua)?;
            table.set("stdout", output.stdout)?;
            table.set("stderr", output.stderr)?;
            Ok((Value::Table(table), Value::Nil))
        }
        Err(e) => result_pair::<Value>(lua, Err(e)),
    }
}

pub fn load(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set("spawn", lua.create_function(spawn)?)?;
    module.set("run", lua.create_function(run_blocking)?)?;
    Ok(module)
}
