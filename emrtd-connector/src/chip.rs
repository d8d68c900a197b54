//! Chip reader contract.
//!
//! The chip reader performs the actual contactless read. The coordinator
//! drives it in two phases: `start` establishes access and reads whatever
//! must precede the handover, `complete` (or `complete_without_ca`) finishes
//! the read. Server-pushed APDUs are forwarded through `relay_apdu`.

use async_trait::async_trait;
use emrtd_core::message::{CaHandback, SecureMessagingInfo};
use emrtd_core::{AccessKey, FileId, FileSet};
use thiserror::Error;

use crate::error::ConnectorError;

/// Chip reader failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChipError {
    /// Hardware session hit its time limit.
    #[error("chip session timed out")]
    Timeout,
    /// Chip communication broke off or an authentication protocol failed.
    #[error("chip session failed: {0}")]
    SessionFailed(String),
    /// The session was invalidated.
    #[error("chip session cancelled")]
    Cancelled,
}

impl From<ChipError> for ConnectorError {
    fn from(e: ChipError) -> Self {
        match e {
            ChipError::Timeout => Self::ChipTimeout,
            ChipError::SessionFailed(msg) => Self::ChipSessionFailed(msg),
            ChipError::Cancelled => Self::Cancelled,
        }
    }
}

/// Input to the first chip phase.
#[derive(Debug, Clone, Copy)]
pub struct ChipReadRequest<'a> {
    /// Access key for BAC/PACE.
    pub access_key: &'a AccessKey,
    /// Active authentication challenge from ACCEPT.
    pub challenge: &'a [u8],
    /// Poll for PACE-only cards.
    pub pace_polling: bool,
}

/// Secure channel parameters the server needs for chip authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoverParameters {
    /// Largest APDU the secure channel can carry.
    pub max_transceive_length_for_secure_messaging: u32,
    /// Block size for file reads.
    pub max_block_size: u32,
    /// Current secure channel.
    pub secure_messaging_info: SecureMessagingInfo,
}

/// Output of the first chip phase.
///
/// `state` is the reader's opaque continuation. It is moved into the second
/// phase and can therefore be consumed only once.
#[derive(Debug)]
pub struct ChipHandover<H> {
    /// Continuation for phase two.
    pub state: H,
    /// Parameters for CA_HANDOVER.
    pub parameters: HandoverParameters,
    /// Files that must reach the server before CA_HANDOVER.
    pub files: FileSet,
}

impl<H> ChipHandover<H> {
    /// Whether the chip exposed its security-key file. Absence selects the
    /// no-CA path.
    pub fn has_security_key(&self) -> bool {
        self.files.has_security_key()
    }
}

/// Output of the second chip phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChipReadResult {
    /// Every file read.
    pub files: FileSet,
    /// Signature over the AA challenge, if the chip supports AA.
    pub active_authentication_signature: Option<Vec<u8>>,
}

/// Caller options for one read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Files that must be present in addition to the mandatory ones.
    pub requested_files: Vec<FileId>,
    /// Poll for PACE-only cards.
    pub pace_polling: bool,
}

impl ReadOptions {
    /// Require `files` in addition to the mandatory ones.
    pub fn with_files(mut self, files: impl IntoIterator<Item = FileId>) -> Self {
        self.requested_files.extend(files);
        self
    }

    /// Enable PACE polling.
    pub fn with_pace_polling(mut self) -> Self {
        self.pace_polling = true;
        self
    }
}

/// How the hardware session ended, shown to the user by the host platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChipSessionEnd {
    /// Read completed and all required files are present.
    Success,
    /// Read failed; the message explains why.
    Failure(String),
}

/// The chip-reading collaborator.
#[async_trait]
pub trait ChipReader: Send + Sync + 'static {
    /// Opaque continuation handed from phase one to phase two.
    type Handover: Send + 'static;

    /// Phase one: access control and pre-handover reads.
    async fn start(
        &self,
        request: ChipReadRequest<'_>,
    ) -> Result<ChipHandover<Self::Handover>, ChipError>;

    /// Phase two after a chip authentication handback.
    async fn complete(
        &self,
        handover: Self::Handover,
        handback: CaHandback,
        requested: &[FileId],
    ) -> Result<ChipReadResult, ChipError>;

    /// Phase two when the chip has no security-key file.
    async fn complete_without_ca(
        &self,
        handover: Self::Handover,
        requested: &[FileId],
    ) -> Result<ChipReadResult, ChipError>;

    /// Transmit a server-issued APDU and return the chip's response.
    async fn relay_apdu(&self, command: &[u8]) -> Result<Vec<u8>, ChipError>;

    /// Abort the hardware session immediately.
    fn invalidate(&self, message: &str);

    /// End the hardware session, signalling success or failure to the user.
    fn finish(&self, end: ChipSessionEnd);
}
