//! Native modules scripts reach through `require`.
//!
//! Every module is a loader that builds the module table. The host decides
//! which of them a script may load; see [`MODULES`].

use mlua::{Lua, Table};

pub mod fswatch;
pub mod log;
pub mod mail;
mod options;
pub mod process;
mod settings;
pub mod shell;

pub use settings::ModuleSettings;

pub type ModuleLoader = fn(&Lua) -> mlua::Result<Table>;

/// Every module this crate provides, by `require` name.
pub const MODULES: &[(&str, ModuleLoader)] = &[
    ("fswatch", fswatch::load),
    ("process", process::load),
    ("shell", shell::load),
    ("mail", mail::load),
    ("log", log::load),
];

pub fn find(name: &str) -> Option<(&'static str, ModuleLoader)> {
    MODULES.iter().find(|(module, _)| *module == name).copied()
}
