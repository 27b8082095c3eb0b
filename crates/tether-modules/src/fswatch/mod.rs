//! `fswatch`: file change notifications delivered to script callbacks.
//!
//! ```lua
//! local fswatch = require("fswatch")
//! local w, err = fswatch.watch{
//!     path = "./src",
//!     recursive = true,
//!     ops = { "create", "rename" },
//!     on_event = function(ev) print(ev.op, ev.path, ev.old_path) end,
//! }
//! ```

mod scanner;

pub use scanner::{Change, TreeScanner, WatchOp};

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bitflags::bitflags;
use mlua::{Function, Lua, Table, UserDataMethods, Value};
use tether_bridge::{
    BridgeContext, BridgeError, CallbackSlot, NativeResource, ResourceHandle, ScriptMethods,
    ScriptObject, ShutdownListener, error_value, result_pair,
};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::options::Options;
use crate::settings::ModuleSettings;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WatchOps: u8 {
        const CREATE = 1 << 0;
        const WRITE = 1 << 1;
        const REMOVE = 1 << 2;
        const RENAME = 1 << 3;
    }
}

impl WatchOps {
    pub fn parse(names: &[String]) -> Result<Self, BridgeError> {
        if names.is_empty() {
            return Ok(Self::all());
        }
        names.iter().try_fold(Self::empty(), |ops, name| {
            let op = match name.as_str() {
                "create" => Self::CREATE,
                "write" => Self::WRITE,
                "remove" => Self::REMOVE,
                "rename" => Self::RENAME,
                other => {
                    return Err(BridgeError::config(format!("unknown watch op '{other}'")));
                }
            };
            Ok(ops | op)
        })
    }

    pub fn allows(&self, op: WatchOp) -> bool {
        let flag = match op {
            WatchOp::Create => Self::CREATE,
            WatchOp::Write => Self::WRITE,
            WatchOp::Remove => Self::REMOVE,
            WatchOp::Rename => Self::RENAME,
        };
        self.contains(flag)
    }
}

/// Parameters for [`FileWatcher::start`].
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub paths: Vec<PathBuf>,
    pub recursive: bool,
    pub interval: Duration,
    pub ops: WatchOps,
    pub extensions: Vec<String>,
}

impl WatchConfig {
    fn from_table(table: &Table, settings: &ModuleSettings) -> Result<Self, BridgeError> {
        let opts = Options::new(table, "watch");

        let mut paths: Vec<PathBuf> = opts.strings("paths")?.into_iter().map(PathBuf::from).collect();
        if let Some(path) = opts.string("path")? {
            paths.insert(0, PathBuf::from(path));
        }

        Ok(Self {
            paths,
            recursive: opts.boolean("recursive")?.unwrap_or(false),
            interval: opts
                .integer("interval_ms")?
                .map(Duration::from_millis)
                .unwrap_or(settings.watch_interval),
            ops: WatchOps::parse(&opts.strings("ops")?)?,
            extensions: opts.strings("extensions")?,
        })
    }
}

pub struct FileWatcher {
    scanner: Mutex<TreeScanner>,
    ops: WatchOps,
    interval: Duration,
    on_event: Arc<CallbackSlot>,
}

impl NativeResource for FileWatcher {
    const KIND: &'static str = "watcher";
}

impl FileWatcher {
    /// Validate `config`, take the initial snapshot and start polling.
    pub fn start(
        ctx: &BridgeContext,
        config: WatchConfig,
        on_event: Arc<CallbackSlot>,
    ) -> Result<Arc<ResourceHandle<FileWatcher>>, BridgeError> {
        if config.paths.is_empty() {
            return Err(BridgeError::config("watch needs at least one path"));
        }
        if config.interval.is_zero() {
            return Err(BridgeError::config("watch interval_ms must be positive"));
        }
        for path in &config.paths {
            if !path.exists() {
                return Err(BridgeError::connect(format!(
                    "cannot watch {}: no such file or directory",
                    path.display()
                )));
            }
        }

        let watcher = FileWatcher {
            scanner: Mutex::new(TreeScanner::new(
                config.paths,
                config.recursive,
                config.extensions,
            )),
            ops: config.ops,
            interval: config.interval,
            on_event,
        };

        let handle = ResourceHandle::new_source(ctx, watcher);
        ctx.spawn(poll_loop(handle.clone(), handle.listener()));
        Ok(handle)
    }

    fn scanner(&self) -> MutexGuard<'_, TreeScanner> {
        self.scanner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_path(&self, path: PathBuf) -> Result<(), BridgeError> {
        if !path.exists() {
            return Err(BridgeError::operation(format!(
                "cannot watch {}: no such file or directory",
                path.display()
            )));
        }
        if !self.scanner().add_root(path.clone()) {
            return Err(BridgeError::operation(format!("{} is already watched", path.display())));
        }
        Ok(())
    }

    pub fn remove_path(&self, path: PathBuf) -> Result<(), BridgeError> {
        if !self.scanner().remove_root(&path) {
            return Err(BridgeError::operation(format!("{} is not watched", path.display())));
        }
        Ok(())
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.scanner().roots().to_vec()
    }

    pub fn scan(&self) -> Vec<Change> {
        self.scanner()
            .scan_changes()
            .into_iter()
            .filter(|c| self.ops.allows(c.op))
            .collect()
    }
}

async fn poll_loop(handle: Arc<ResourceHandle<FileWatcher>>, mut done: ShutdownListener) {
    let Ok(watcher) = handle.native() else {
        return;
    };
    let mut ticker = tokio::time::interval(watcher.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; the initial snapshot is already taken.
    ticker.tick().await;
    drop(watcher);

    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Ok(watcher) = handle.native() else {
            break;
        };
        let on_event = watcher.on_event.clone();
        let changes = match tokio::task::spawn_blocking(move || watcher.scan()).await {
            Ok(changes) => changes,
            Err(e) => {
                warn!(target: "fswatch", "Scan task failed: {}", e);
                continue;
            }
        };

        for change in changes {
            if !handle.emit("fswatch.event", &on_event, move |lua| event_table(lua, &change)) {
                break;
            }
        }
    }

    debug!(target: "fswatch", "Watcher #{} stopped polling", handle.id());
}

fn event_table(lua: &Lua, change: &Change) -> mlua::Result<Table> {
    let event = lua.create_table()?;
    event.set("op", change.op.to_string())?;
    event.set("path", change.path.display().to_string())?;
    if let Some(old) = &change.old_path {
        event.set("old_path", old.display().to_string())?;
    }
    Ok(event)
}

impl ScriptMethods for FileWatcher {
    fn add_methods<M: UserDataMethods<ScriptObject<Self>>>(methods: &mut M) {
        methods.add_method("add_path", |lua, this, path: String| {
            error_value(lua, this.native().and_then(|w| w.add_path(PathBuf::from(path))))
        });
        methods.add_method("remove_path", |lua, this, path: String| {
            error_value(lua, this.native().and_then(|w| w.remove_path(PathBuf::from(path))))
        });
        methods.add_method("paths", |lua, this, ()| {
            let paths = this.native().map(|w| {
                w.paths()
                    .into_iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
            });
            result_pair(lua, paths)
        });
        methods.add_method("on_event", |lua, this, callback: Option<Function>| {
            let watcher = match this.native() {
                Ok(w) => w,
                Err(e) => return error_value(lua, Err(e)),
            };
            watcher.on_event.set(lua, callback)?;
            Ok(Value::Nil)
        });
    }
}

fn watch(lua: &Lua, table: Table) -> mlua::Result<(Value, Value)> {
    let on_event = Arc::new(CallbackSlot::new());
    let started = (|| {
        let ctx = BridgeContext::from_lua(lua)?;
        let config = WatchConfig::from_table(&table, &ModuleSettings::from_lua(lua))?;
        let callback = Options::new(&table, "watch").function("on_event")?;
        on_event
            .set(lua, callback)
            .map_err(|e| BridgeError::Runtime(e.to_string()))?;
        FileWatcher::start(&ctx, config, on_event.clone())
    })();

    match started {
        Ok(handle) => {
            let ud = ScriptObject::new(handle).into_userdata(lua)?;
            Ok((Value::UserData(ud), Value::Nil))
        }
        Err(e) => result_pair::<Value>(lua, Err(e)),
    }
}

pub fn load(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set("watch", lua.create_function(watch)?)?;
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ops() {
        assert_eq!(WatchOps::parse(&[]).unwrap(), WatchOps::all());
        let ops = WatchOps::parse(&["create".into(), "rename".into()]).unwrap();
        assert!(ops.allows(WatchOp::Create));
        assert!(ops.allows(WatchOp::Rename));
        assert!(!ops.allows(WatchOp::Write));
        assert!(WatchOps::parse(&["chmod".into()]).unwrap_err().to_string().contains("chmod"));
    }

    #[test]
    fn test_op_names() {
        assert_eq!(WatchOp::Create.to_string(), "create");
        assert_eq!(WatchOp::Rename.to_string(), "rename");
    }
}
