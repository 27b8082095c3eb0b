//! Makes the enabled native modules reachable through `require`.

use mlua::{Lua, Table};
use tracing::debug;

use tether_modules::ModuleLoader;

use crate::error::HostError;

/// Resolve `enabled` against the module catalog, rejecting unknown names.
pub fn resolve(enabled: &[String]) -> Result<Vec<(&'static str, ModuleLoader)>, HostError> {
    enabled
        .iter()
        .map(|name| {
            tether_modules::find(name).ok_or_else(|| HostError::UnknownModule(name.clone()))
        })
        .collect()
}

/// Register each module in `package.preload`, so it is built on first
/// `require` and cached by Lua afterwards.
pub fn install(lua: &Lua, modules: &[(&'static str, ModuleLoader)]) -> Result<(), HostError> {
    let preload: Table = lua.globals().get::<Table>("package")?.get("preload")?;
    for &(name, loader) in modules {
        preload.set(name, lua.create_function(move |lua, _: mlua::MultiValue| loader(lua))?)?;
        debug!(target: "host", "Registered module '{}'", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_unknown() {
        let err = resolve(&["log".into(), "telnet".into()]).unwrap_err();
        assert!(matches!(err, HostError::UnknownModule(ref m) if m == "telnet"));
        assert_eq!(resolve(&["log".into()]).unwrap().len(), 1);
    }

    #[test]
    fn test_only_installed_modules_can_be_required() {
        let lua = Lua::new();
        install(&lua, &resolve(&["log".into()]).unwrap()).unwrap();

        let same: bool = lua
            .load(r#"return require("log") == require("log")"#)
            .eval()
            .unwrap();
        assert!(same);

        let missing: bool = lua
            .load(r#"return (pcall(require, "process"))"#)
            .eval()
            .unwrap();
        assert!(!missing);
    }
}
