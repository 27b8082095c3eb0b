//! `log`: script messages routed into the host's tracing output.

use mlua::{Lua, Table, Value, Variadic};
use tracing::{debug, error, info, warn};

fn join(args: Variadic<Value>) -> mlua::Result<String> {
    let parts = args
        .iter()
        .map(|v| v.to_string())
        .collect::<mlua::Result<Vec<_>>>()?;
    Ok(parts.join("\t"))
}

pub fn load(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    module.set(
        "debug",
        lua.create_function(|_, args: Variadic<Value>| {
            debug!(target: "script", "{}", join(args)?);
            Ok(())
        })?,
    )?;
    module.set(
        "info",
        lua.create_function(|_, args: Variadic<Value>| {
            info!(target: "script", "{}", join(args)?);
            Ok(())
        })?,
    )?;
    module.set(
        "warn",
        lua.create_function(|_, args: Variadic<Value>| {
            warn!(target: "script", "{}", join(args)?);
            Ok(())
        })?,
    )?;
    module.set(
        "error",
        lua.create_function(|_, args: Variadic<Value>| {
            error!(target: "script", "{}", join(args)?);
            Ok(())
        })?,
    )?;
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_uses_tostring() {
        let lua = Lua::new();
        let args: Variadic<Value> = lua
            .load(r#"return "a", 1, true, nil"#)
            .eval::<mlua::MultiValue>()
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(join(args).unwrap(), "a\t1\ttrue\tnil");
    }

    #[test]
    fn test_functions_accept_any_values() {
        let lua = Lua::new();
        lua.globals().set("log", load(&lua).unwrap()).unwrap();
        lua.load(r#"log.info("count", 3); log.debug({}); log.warn(); log.error("x")"#)
            .exec()
            .unwrap();
    }
}
