//! Protocol errors.
//!
//! Every error here is raised by pure protocol logic: framing, message
//! decoding, state legality and file completeness. The connector maps them
//! onto its caller-facing taxonomy.

use thiserror::Error;

use crate::files::FileId;
use crate::message::MessageKind;
use crate::state::ProtocolState;

/// All possible protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    // --- State Machine ---
    /// Transition not present in the transition table.
    #[error("invalid state transition from {current} to {requested}")]
    InvalidState {
        /// State the machine was in.
        current: ProtocolState,
        /// State that was requested.
        requested: ProtocolState,
    },

    /// Message kind may not be sent in the current state.
    #[error("{kind} may not be sent in state {state}")]
    IllegalSend {
        /// Kind of the outbound message.
        kind: MessageKind,
        /// State at the time of sending.
        state: ProtocolState,
    },

    /// Message kind may not be received in the current state.
    #[error("unexpected {kind} in state {state}")]
    UnexpectedMessage {
        /// Kind of the inbound message.
        kind: MessageKind,
        /// State at the time of receipt.
        state: ProtocolState,
    },

    // --- Framing ---
    /// Binary frame is shorter than the minimum frame length.
    #[error("binary frame too short ({0} bytes)")]
    FrameTooShort(usize),

    /// Unknown binary frame type byte.
    #[error("unknown binary frame type 0x{0:02x}")]
    UnknownFrameType(u8),

    /// FILE frame declares a name longer than the frame itself.
    #[error("file name length {declared} exceeds frame ({available} bytes available)")]
    FileNameOutOfBounds {
        /// Declared name length.
        declared: usize,
        /// Bytes available after the header.
        available: usize,
    },

    /// FILE frame name does not fit in one length byte.
    #[error("file name too long ({0} bytes)")]
    FileNameTooLong(usize),

    /// FILE frame name is empty or not valid UTF-8.
    #[error("invalid file name")]
    InvalidFileName,

    /// Unknown file identifier.
    #[error("unknown file identifier {0:?}")]
    UnknownFile(String),

    // --- Messages ---
    /// Text frame is not a well-formed protocol message.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Access key values are malformed.
    #[error("invalid access key: {0}")]
    InvalidAccessKey(&'static str),

    // --- Files ---
    /// Chip read finished without all required files.
    #[error("incomplete read, missing {missing:?}: {reason}")]
    IncompleteRead {
        /// Missing file identifiers, mandatory ones first, no duplicates.
        missing: Vec<FileId>,
        /// Human-readable reason.
        reason: String,
    },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedMessage(e.to_string())
    }
}
