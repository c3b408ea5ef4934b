use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Framing and payload errors at the wire boundary.
///
/// These never reach the state-sync core: the transport logs and drops the
/// offending frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("invalid `{event}` payload: {reason}")]
    InvalidPayload { event: String, reason: String },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine data directory")]
    NoDataDir,
    #[error("failed to create data directory {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to read config {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("missing value for {0}")]
    MissingValue(String),
    #[error("unknown argument {0:?}")]
    UnknownArgument(String),
}
