//! Error type shared by every layer of the bus.

/// Errors raised by the registry, the dispatcher, the module registry and
/// the transport.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bad arguments: {0}")]
    BadArguments(String),
    #[error("command {0} already registered")]
    DuplicateCommand(String),
    #[error("{0} is not a valid module")]
    InvalidModule(String),
    #[error("module {0} is already loaded")]
    ModuleLoaded(String),
    #[error("the command \"{0}\" is not available")]
    CommandUnavailable(String),
    #[error("handler error: {0}")]
    Handler(String),
    #[error("handler panicked: {0}")]
    HandlerPanic(String),
    #[error("cannot bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no port left to bind on {0}")]
    PortsExhausted(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl BusError {
    /// Shorthand for handler-side failures.
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }
}

/// Result alias used across the crate.
pub type BusResult<T> = Result<T, BusError>;
