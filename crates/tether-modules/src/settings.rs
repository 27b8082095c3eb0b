use std::time::Duration;

use mlua::Lua;

/// Defaults the modules fall back to when a script leaves a field out.
#[derive(Debug, Clone)]
pub struct ModuleSettings {
    pub watch_interval: Duration,
    pub default_transport: String,
    pub mail_timeout: Duration,
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            watch_interval: Duration::from_millis(250),
            default_transport: "local".to_string(),
            mail_timeout: Duration::from_millis(10_000),
        }
    }
}

impl ModuleSettings {
    pub fn install(&self, lua: &Lua) {
        lua.set_app_data(self.clone());
    }

    pub fn from_lua(lua: &Lua) -> Self {
        lua.app_data_ref::<ModuleSettings>()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}
