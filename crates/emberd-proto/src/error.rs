//! Decode errors for the wire protocol.
//!
//! Codec failures are fatal to the connection: once the decoder loses the
//! record boundary there is no way to resynchronize a stream that carries
//! no outer framing. The peer reports the error and tears the session
//! down.

use std::io;

use thiserror::Error;

/// Errors raised while decoding a record from the stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Leading type tag is not a known message type.
    #[error("unknown message tag: {0}")]
    UnknownTag(u8),

    /// A string body violated the modified UTF-8 encoding.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// The stream ended inside a record.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// Underlying transport error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl DecodeError {
    /// Fold an `io::Error` into the decode error space, mapping a clean
    /// `UnexpectedEof` kind onto [`DecodeError::UnexpectedEof`].
    pub(crate) fn from_read(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::UnexpectedEof
        } else {
            Self::Io(err)
        }
    }
}
