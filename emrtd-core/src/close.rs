//! Close codes and machine-readable close reasons.

use std::fmt;

/// WebSocket close code used by the validation server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000: normal closure.
    Normal,
    /// 1001: transient failure (timeouts, chip communication lost).
    Transient,
    /// 1008: policy violation (bad START, bad access key format).
    PolicyViolation,
    /// 1011: server failure.
    ServerFailure,
    /// 4401: invalid client identity.
    InvalidClient,
    /// 4403: access control on the chip failed.
    AccessDenied,
    /// Any other code.
    Other(u16),
}

impl CloseCode {
    /// Numeric value.
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::Transient => 1001,
            Self::PolicyViolation => 1008,
            Self::ServerFailure => 1011,
            Self::InvalidClient => 4401,
            Self::AccessDenied => 4403,
            Self::Other(code) => code,
        }
    }

    /// Whether a server error carrying this code may succeed on retry.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Transient | Self::ServerFailure)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::Transient,
            1008 => Self::PolicyViolation,
            1011 => Self::ServerFailure,
            4401 => Self::InvalidClient,
            4403 => Self::AccessDenied,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Reason string sent alongside a close.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Server waited too long for START.
    TimeoutWaitingForStart,
    /// Server waited too long for a client response.
    TimeoutWaitingForResponse,
    /// Chip communication broke off.
    ChipCommunicationFailed,
    /// Session exceeded its maximum lifetime.
    MaxSessionTimeExceeded,
    /// START message was malformed.
    InvalidStartMessage,
    /// Access key values were malformed.
    InvalidAccessKeyValues,
    /// Client sent a message out of order.
    UnexpectedMessage,
    /// Client id unknown to the server.
    InvalidClientId,
    /// BAC/PACE rejected the access key.
    AccessControlFailed,
    /// Generic server failure.
    ServerError,
    /// Server-side passport reader failed.
    PassportReaderError,
    /// Post-processing of the read failed.
    PostprocessFailed,
    /// Anything else.
    Unknown(String),
}

impl CloseReason {
    /// Parse the server's reason string.
    pub fn parse(reason: &str) -> Self {
        match reason {
            "TIMEOUT_WHILE_WAITING_FOR_START_MESSAGE" => Self::TimeoutWaitingForStart,
            "TIMEOUT_WHILE_WAITING_FOR_RESPONSE" => Self::TimeoutWaitingForResponse,
            "NFC_CHIP_COMMUNICATION_FAILED" => Self::ChipCommunicationFailed,
            "MAX_SESSION_TIME_EXCEEDED" => Self::MaxSessionTimeExceeded,
            "INVALID_START_MESSAGE" => Self::InvalidStartMessage,
            "INVALID_ACCESS_KEY_VALUES" => Self::InvalidAccessKeyValues,
            "UNEXPECTED_MESSAGE" => Self::UnexpectedMessage,
            "INVALID_CLIENT_ID" => Self::InvalidClientId,
            "ACCESS_CONTROL_FAILED" => Self::AccessControlFailed,
            "SERVER_ERROR" => Self::ServerError,
            "EMRTD_PASSPORT_READER_ERROR" => Self::PassportReaderError,
            "POSTPROCESS_FAILED" => Self::PostprocessFailed,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Wire form of the reason.
    pub fn as_str(&self) -> &str {
        match self {
            Self::TimeoutWaitingForStart => "TIMEOUT_WHILE_WAITING_FOR_START_MESSAGE",
            Self::TimeoutWaitingForResponse => "TIMEOUT_WHILE_WAITING_FOR_RESPONSE",
            Self::ChipCommunicationFailed => "NFC_CHIP_COMMUNICATION_FAILED",
            Self::MaxSessionTimeExceeded => "MAX_SESSION_TIME_EXCEEDED",
            Self::InvalidStartMessage => "INVALID_START_MESSAGE",
            Self::InvalidAccessKeyValues => "INVALID_ACCESS_KEY_VALUES",
            Self::UnexpectedMessage => "UNEXPECTED_MESSAGE",
            Self::InvalidClientId => "INVALID_CLIENT_ID",
            Self::AccessControlFailed => "ACCESS_CONTROL_FAILED",
            Self::ServerError => "SERVER_ERROR",
            Self::PassportReaderError => "EMRTD_PASSPORT_READER_ERROR",
            Self::PostprocessFailed => "POSTPROCESS_FAILED",
            Self::Unknown(reason) => reason,
        }
    }

    /// Whether the reason is one the server documents.
    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }

    /// Close code the server pairs with this reason.
    pub fn expected_code(&self) -> CloseCode {
        match self {
            Self::TimeoutWaitingForStart
            | Self::TimeoutWaitingForResponse
            | Self::ChipCommunicationFailed
            | Self::MaxSessionTimeExceeded => CloseCode::Transient,
            Self::InvalidStartMessage | Self::InvalidAccessKeyValues | Self::UnexpectedMessage => {
                CloseCode::PolicyViolation
            }
            Self::InvalidClientId => CloseCode::InvalidClient,
            Self::AccessControlFailed => CloseCode::AccessDenied,
            Self::ServerError
            | Self::PassportReaderError
            | Self::PostprocessFailed
            | Self::Unknown(_) => CloseCode::ServerFailure,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
