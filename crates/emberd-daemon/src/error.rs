//! Daemon error types.

use std::io;

use emberd_proto::DecodeError;
use thiserror::Error;

/// Errors that end a daemon session.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The client sent bytes the codec could not decode.
    #[error("protocol error: {0}")]
    Protocol(#[from] DecodeError),

    /// The session opened with something other than a `BuildRequest`.
    #[error("protocol violation: expected BuildRequest, got tag {0}")]
    UnexpectedOpening(u8),

    /// The client went silent past the liveness timeout.
    #[error("client connection timed out")]
    ClientTimeout,

    /// The client disconnected mid-session.
    #[error("client disconnected")]
    ClientGone,
}
