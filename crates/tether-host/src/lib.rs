//! Hosts one Lua interpreter together with the native modules it may
//! `require` and the run loop that delivers their events.

pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod registry;

pub use config::{ConfigLoadError, EXAMPLE_CONFIG, HostConfig};
pub use error::HostError;
pub use host::{RunSummary, ScriptHost};
pub use logging::init_logging;
