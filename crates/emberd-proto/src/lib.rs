//! Wire protocol shared by the emberd client and daemon.
//!
//! The protocol is a stream of tagged binary records over a reliable,
//! ordered byte channel. Each record starts with a 1-byte type tag; there
//! is no outer length prefix, so the decoder is the single source of truth
//! for record boundaries. All multi-byte integers are big-endian and
//! strings use the Java-modified UTF-8 convention for interop with
//! existing daemon peers.
//!
//! Layers:
//! - [`Message`]: the closed tagged union of every record type
//! - [`codec`]: encoding into buffers and incremental decoding from a
//!   byte stream
//! - [`order`]: deterministic replay ordering for batched dispatch

pub mod codec;
pub mod error;
pub mod message;
pub mod order;

pub use codec::{encode_message, read_message};
pub use error::DecodeError;
pub use message::{Message, MojoStarted, TransferEvent, TransferPhase};
pub use order::{class_order, Sequenced};
