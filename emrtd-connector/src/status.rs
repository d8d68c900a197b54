//! Validation progress.
//!
//! The coordinator publishes a [`ValidationStep`] at every phase change.
//! Turning a step into something a user can read is a separate, pure
//! function so hosts can replace it with their own wording.

use std::fmt;

use emrtd_core::AccessKeyKind;

/// Phase of a validation session, as seen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationStep {
    /// Nothing started.
    Idle,
    /// Opening the connection.
    Connecting,
    /// Connection open.
    Connected,
    /// START sent, waiting for the server.
    Starting,
    /// Chip reader is establishing access and reading.
    ReadingChip,
    /// Server is authenticating the chip.
    AuthenticatingChip,
    /// Reading the remaining files.
    CompletingRead,
    /// Uploading files and FINISH.
    SendingFiles,
    /// Waiting for the validation result.
    WaitingForResult,
    /// Outcome received.
    Completed,
    /// Session failed.
    Failed,
    /// Caller cancelled.
    Cancelled,
}

impl ValidationStep {
    /// The chip must stay in the reader's field during this step.
    pub fn needs_document(self) -> bool {
        matches!(
            self,
            Self::ReadingChip | Self::AuthenticatingChip | Self::CompletingRead
        )
    }

    /// No further steps follow.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ValidationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Starting => "starting",
            Self::ReadingChip => "readingChip",
            Self::AuthenticatingChip => "authenticatingChip",
            Self::CompletingRead => "completingRead",
            Self::SendingFiles => "sendingFiles",
            Self::WaitingForResult => "waitingForResult",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What the display text may depend on besides the step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusContext {
    /// Kind of access key in use, once known.
    pub access_key: Option<AccessKeyKind>,
}

/// Default English display text for `step`.
pub fn status_text(step: ValidationStep, context: &StatusContext) -> String {
    match step {
        ValidationStep::Idle => "Ready".into(),
        ValidationStep::Connecting | ValidationStep::Connected => {
            "Connecting to the validation service".into()
        }
        ValidationStep::Starting => "Preparing validation".into(),
        ValidationStep::ReadingChip => match context.access_key {
            Some(AccessKeyKind::Can) => {
                "Hold your document against the reader. Unlocking with the card access number"
                    .into()
            }
            Some(AccessKeyKind::Mrz) => {
                "Hold your document against the reader. Unlocking with the document details"
                    .into()
            }
            None => "Hold your document against the reader".into(),
        },
        ValidationStep::AuthenticatingChip => {
            "Checking the chip. Keep the document still".into()
        }
        ValidationStep::CompletingRead => "Reading document data. Keep the document still".into(),
        ValidationStep::SendingFiles => "Document read. You can remove it now".into(),
        ValidationStep::WaitingForResult => "Validating document".into(),
        ValidationStep::Completed => "Validation finished".into(),
        ValidationStep::Failed => "Validation failed".into(),
        ValidationStep::Cancelled => "Validation cancelled".into(),
    }
}
