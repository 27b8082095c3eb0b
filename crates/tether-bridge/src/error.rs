/// Errors surfaced by handles, the event queue and the dispatcher.
///
/// Script code sees the `Display` text in the error slot of a call. Rust
/// callers can match on the variant.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Invalid or missing construction parameters. No handle was created.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Native setup failed. Any partially acquired resource was released.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The handle was closed before the operation started.
    #[error("{kind} handle is closed")]
    Closed { kind: &'static str },

    /// A single call failed; the handle is still usable.
    #[error("{0}")]
    Operation(String),

    /// A script callback raised while being dispatched.
    #[error("callback failed: {0}")]
    Callback(String),

    /// Host-level failure outside any handle.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl BridgeError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect(message.into())
    }

    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation(message.into())
    }

    pub fn closed(kind: &'static str) -> Self {
        Self::Closed { kind }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    /// Short machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Connect(_) => "connect",
            Self::Closed { .. } => "closed",
            Self::Operation(_) => "operation",
            Self::Callback(_) => "callback",
            Self::Runtime(_) => "runtime",
        }
    }
}

impl From<BridgeError> for mlua::Error {
    fn from(err: BridgeError) -> Self {
        mlua::Error::external(err)
    }
}
