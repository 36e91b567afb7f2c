use thiserror::Error;

use crate::core::wire::Command;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Framing violation found while decoding (truncated header, length overrun).
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Only ever produced inside the registry; callers see an empty result instead.
    #[error("unknown topic `{0}`")]
    UnknownTopic(String),
    #[error("request with data handler not configured")]
    HandlerNotConfigured,
    #[error("request handler panicked: {0}")]
    HandlerPanicked(String),
    #[error("command mismatch: sent {sent}, received {received}")]
    ProtocolMismatch { sent: Command, received: Command },
    #[error("responder returned error: {0}")]
    RemoteError(String),
    #[error("invalid endpoint `{0}`: expected tcp://host:port or ipc://path")]
    InvalidEndpoint(String),
    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
