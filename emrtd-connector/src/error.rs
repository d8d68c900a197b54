//! Connector errors.
//!
//! Every error carries a category, a description (its `Display`), an
//! optional recovery suggestion and a retryable flag. Errors are `Clone` so
//! one failure can resolve every waiter with the same value.

use emrtd_core::{CloseCode, CloseReason, FileId, MessageKind, ProtocolError, ProtocolState};
use thiserror::Error;

/// Coarse error category shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection to the server.
    Connection,
    /// Message sequencing or content.
    Protocol,
    /// Socket I/O and decoding.
    Transport,
    /// Chip reader.
    Chip,
    /// Illegal state transition.
    State,
    /// Server closed the session with an error.
    Server,
    /// Outcome received but not valid.
    Validation,
    /// Caller cancelled.
    Cancelled,
}

impl ErrorCategory {
    /// Short label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Protocol => "protocol",
            Self::Transport => "transport",
            Self::Chip => "chip",
            Self::State => "state",
            Self::Server => "server",
            Self::Validation => "validation",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Errors that can occur while validating a document.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectorError {
    // --- Connection ---
    /// Could not open the channel or the liveness probe failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// Channel closed before the session completed.
    #[error("connection closed")]
    ConnectionClosed,
    /// Server or chip did not respond in time.
    #[error("connection timed out")]
    ConnectionTimeout,
    /// Operation needs an open channel.
    #[error("not connected")]
    NotConnected,
    /// Host has no usable network.
    #[error("no network")]
    NoNetwork,

    // --- Protocol ---
    /// Server sent a message that is illegal in the current state.
    #[error("unexpected {kind} in state {state}")]
    UnexpectedMessage {
        /// Inbound kind.
        kind: MessageKind,
        /// State at receipt.
        state: ProtocolState,
    },
    /// Server response is unusable.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// CA_HANDOVER could not be built or sent.
    #[error("handover failed: {0}")]
    HandoverFailed(String),
    /// Server reported a failed chip authentication handback.
    #[error("handback failed: {0}")]
    HandbackFailed(String),

    // --- Transport ---
    /// Writing to the channel failed.
    #[error("send failed: {0}")]
    Send(String),
    /// Reading from the channel failed.
    #[error("receive failed: {0}")]
    Receive(String),
    /// Inbound frame could not be decoded.
    #[error("decode failed: {0}")]
    Decode(ProtocolError),

    // --- Chip ---
    /// Chip reader exceeded its time budget.
    #[error("chip read timed out")]
    ChipTimeout,
    /// Chip session broke off.
    #[error("chip session failed: {0}")]
    ChipSessionFailed(String),
    /// Chip read finished without required files.
    #[error("incomplete read, missing {missing:?}: {reason}")]
    IncompleteRead {
        /// Missing files.
        missing: Vec<FileId>,
        /// Why.
        reason: String,
    },

    // --- State ---
    /// Requested transition is not allowed.
    #[error("invalid state transition from {current} to {requested}")]
    InvalidState {
        /// Current state.
        current: ProtocolState,
        /// Requested state.
        requested: ProtocolState,
    },

    // --- Server ---
    /// Server closed the session with an error.
    #[error("server closed session ({code}): {reason}")]
    Server {
        /// Close code.
        code: CloseCode,
        /// Parsed reason.
        reason: CloseReason,
    },

    // --- Validation ---
    /// Outcome arrived but the document did not validate.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    // --- Lifecycle ---
    /// Caller cancelled or the session was torn down.
    #[error("cancelled")]
    Cancelled,
}

impl ConnectorError {
    /// Category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConnectionFailed(_)
            | Self::ConnectionClosed
            | Self::ConnectionTimeout
            | Self::NotConnected
            | Self::NoNetwork => ErrorCategory::Connection,
            Self::UnexpectedMessage { .. }
            | Self::InvalidResponse(_)
            | Self::HandoverFailed(_)
            | Self::HandbackFailed(_) => ErrorCategory::Protocol,
            Self::Send(_) | Self::Receive(_) | Self::Decode(_) => ErrorCategory::Transport,
            Self::ChipTimeout | Self::ChipSessionFailed(_) | Self::IncompleteRead { .. } => {
                ErrorCategory::Chip
            }
            Self::InvalidState { .. } => ErrorCategory::State,
            Self::Server { .. } => ErrorCategory::Server,
            Self::ValidationFailed(_) => ErrorCategory::Validation,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Whether a caller may retry the whole validation.
    ///
    /// Access control and malformed-request failures are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed(_)
            | Self::ConnectionClosed
            | Self::ConnectionTimeout
            | Self::NoNetwork
            | Self::Send(_)
            | Self::Receive(_)
            | Self::ChipTimeout
            | Self::ChipSessionFailed(_) => true,
            Self::Server { code, .. } => code.is_transient(),
            _ => false,
        }
    }

    /// Whether the connect phase may be re-attempted automatically.
    pub fn is_connect_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::ConnectionTimeout
                | Self::NoNetwork
                | Self::Receive(_)
        )
    }

    /// What the user can do about it.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Self::ConnectionFailed(_) | Self::NoNetwork => {
                Some("Check the network connection and try again.")
            }
            Self::ConnectionClosed | Self::ConnectionTimeout => Some("Try again."),
            Self::ChipTimeout | Self::ChipSessionFailed(_) | Self::IncompleteRead { .. } => {
                Some("Hold the document still against the reader until reading completes.")
            }
            Self::Server { reason, .. } => match reason {
                CloseReason::AccessControlFailed | CloseReason::InvalidAccessKeyValues => {
                    Some("Check the document number, dates or CAN and try again.")
                }
                CloseReason::InvalidClientId => None,
                _ if self.is_retryable() => Some("Try again later."),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<ProtocolError> for ConnectorError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::InvalidState { current, requested } => {
                Self::InvalidState { current, requested }
            }
            ProtocolError::UnexpectedMessage { kind, state } => {
                Self::UnexpectedMessage { kind, state }
            }
            ProtocolError::IncompleteRead { missing, reason } => {
                Self::IncompleteRead { missing, reason }
            }
            ProtocolError::IllegalSend { kind, state } => Self::InvalidResponse(format!(
                "{kind} may not be sent in state {state}"
            )),
            other => Self::Decode(other),
        }
    }
}
