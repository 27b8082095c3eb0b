use thiserror::Error;

use tether_bridge::BridgeError;

use crate::config::ConfigLoadError;

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigLoadError),

    #[error("unknown module '{0}'")]
    UnknownModule(String),

    #[error("failed to start runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("cannot read script {path}: {source}")]
    ReadScript {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("script error: {0}")]
    Lua(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl From<mlua::Error> for HostError {
    fn from(err: mlua::Error) -> Self {
        HostError::Lua(err.to_string())
    }
}
