//! Deterministic replay ordering for batched dispatch.
//!
//! When the daemon drains a burst of already-received messages before
//! forwarding them, the batch is sorted into a canonical order: control
//! and build-structure messages first, logs late, terminators last. Ties
//! within a class resolve by construction order. This is strictly an
//! in-process re-sort of a buffer; the wire always carries messages in
//! the order they were produced.

use std::{
    cmp::Ordering,
    sync::atomic::{AtomicU64, Ordering as AtomicOrdering},
    time::Instant,
};

use crate::message::Message;

/// Replay class of a message, per the canonical ordering table.
///
/// # Panics
///
/// `KeyboardInput` and `CancelBuild` never enter a replay buffer: the
/// first is client-internal, the second is dispatched immediately on its
/// own. `BuildStatus` has no assigned class in the canonical ordering
/// table. Asking for any of their classes is a programming error.
#[must_use]
pub fn class_order(message: &Message) -> u8 {
    match message {
        Message::KeepAlive | Message::BuildRequest { .. } => 0,
        Message::BuildStarted { .. } => 1,
        Message::Prompt { .. }
        | Message::PromptResponse { .. }
        | Message::Display { .. }
        | Message::PrintOut { .. }
        | Message::PrintErr { .. }
        | Message::RequestInput { .. }
        | Message::InputData { .. } => 2,
        Message::ProjectStarted { .. } => 3,
        Message::MojoStarted(_) => 4,
        Message::ExecutionFailure { .. } => 10,
        Message::Transfer { phase, .. } => {
            if phase.is_terminal() {
                42
            } else if matches!(phase, crate::message::TransferPhase::Progressed) {
                41
            } else {
                40
            }
        },
        Message::ProjectLogMessage { .. } => 50,
        Message::BuildLogMessage { .. } => 51,
        Message::ProjectStopped { .. } => 95,
        Message::BuildFinished { .. } => 96,
        Message::BuildException { .. } => 97,
        Message::Stop => 99,
        Message::KeyboardInput { .. } | Message::CancelBuild | Message::BuildStatus { .. } => {
            panic!("message has no replay class: {message:?}")
        },
    }
}

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A message stamped with a process-monotonic sequence number and its
/// creation instant.
///
/// The sequence number is assigned at construction and breaks ties
/// between messages of the same replay class; the instant exists for
/// in-process diagnostics. Neither field ever reaches the wire.
#[derive(Debug, Clone)]
pub struct Sequenced {
    seq: u64,
    created: Instant,
    message: Message,
}

impl Sequenced {
    /// Stamp `message` with the next sequence number.
    pub fn new(message: Message) -> Self {
        Self {
            seq: SEQUENCE.fetch_add(1, AtomicOrdering::Relaxed),
            created: Instant::now(),
            message,
        }
    }

    /// Construction-order sequence number.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Construction instant.
    #[must_use]
    pub fn created(&self) -> Instant {
        self.created
    }

    /// The wrapped message.
    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Unwrap the message.
    #[must_use]
    pub fn into_message(self) -> Message {
        self.message
    }

    fn key(&self) -> (u8, u64) {
        (class_order(&self.message), self.seq)
    }
}

impl PartialEq for Sequenced {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Sequenced {}

impl PartialOrd for Sequenced {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sequenced {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}
