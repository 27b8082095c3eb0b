//! Exposing handles to Lua.

use std::sync::Arc;

use mlua::{AnyUserData, IntoLua, Lua, MetaMethod, UserData, UserDataMethods, Value};
use tracing::debug;

use crate::error::BridgeError;
use crate::handle::{NativeResource, ResourceHandle};

/// Methods a native resource adds on top of the common handle surface
/// (`close`, `is_closed`, `id`, `tostring`).
pub trait ScriptMethods: NativeResource + Sized {
    fn add_methods<M: UserDataMethods<ScriptObject<Self>>>(methods: &mut M);
}

/// The userdata a script holds.
///
/// Collecting it closes the handle if the script did not.
pub struct ScriptObject<T: NativeResource> {
    handle: Arc<ResourceHandle<T>>,
}

impl<T: NativeResource> ScriptObject<T> {
    pub fn new(handle: Arc<ResourceHandle<T>>) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &Arc<ResourceHandle<T>> {
        &self.handle
    }

    pub fn native(&self) -> Result<Arc<T>, BridgeError> {
        self.handle.native()
    }
}

impl<T: ScriptMethods> ScriptObject<T> {
    pub fn into_userdata(self, lua: &Lua) -> mlua::Result<AnyUserData> {
        lua.create_userdata(self)
    }
}

impl<T: ScriptMethods> UserData for ScriptObject<T> {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("close", |lua, this, ()| error_value(lua, this.handle.close()));
        methods.add_method("is_closed", |_, this, ()| Ok(this.handle.is_closed()));
        methods.add_method("id", |_, this, ()| Ok(this.handle.id().get()));
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            let state = if this.handle.is_closed() { " (closed)" } else { "" };
            Ok(format!("{}#{}{}", T::KIND, this.handle.id(), state))
        });

        T::add_methods(methods);
    }
}

impl<T: NativeResource> Drop for ScriptObject<T> {
    fn drop(&mut self) {
        if !self.handle.is_closed() {
            debug!(target: "bridge", "Finalizing unclosed {} #{}", T::KIND, self.handle.id());
            let _ = self.handle.close();
        }
    }
}

/// Convert a fallible operation into Lua's `(value, err)` convention.
pub fn result_pair<R: IntoLua>(lua: &Lua, result: Result<R, BridgeError>) -> mlua::Result<(Value, Value)> {
    match result {
        Ok(value) => Ok((value.into_lua(lua)?, Value::Nil)),
        Err(err) => Ok((Value::Nil, error_string(lua, &err)?)),
    }
}

/// `nil` on success, the error message otherwise.
pub fn error_value(lua: &Lua, result: Result<(), BridgeError>) -> mlua::Result<Value> {
    match result {
        Ok(()) => Ok(Value::Nil),
        Err(err) => error_string(lua, &err),
    }
}

fn error_string(lua: &Lua, err: &BridgeError) -> mlua::Result<Value> {
    Ok(Value::String(lua.create_string(err.to_string())?))
}
