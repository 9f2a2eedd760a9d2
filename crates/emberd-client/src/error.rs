//! Client error types.

use std::io;

use emberd_proto::DecodeError;
use thiserror::Error;

/// Errors that end a client invocation.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not reach or keep the daemon connection.
    #[error("daemon connection failed: {0}")]
    Connection(String),

    /// The daemon sent bytes the codec could not decode.
    #[error("protocol error: {0}")]
    Protocol(#[from] DecodeError),

    /// The terminal could not be acquired or driven.
    #[error("terminal unavailable: {0}")]
    Terminal(String),

    /// Log sink failure (file-backed sinks fail fast).
    #[error("log sink error: {0}")]
    Sink(#[from] io::Error),
}
