//! Binary framing for FILE and APDU messages.
//!
//! FILE frame:
//! ```text
//! +----------+--------------+----------------------+-------------+
//! | 0x01 (1B)| NAME LEN (1B)| NAME (UTF-8, N bytes)| PAYLOAD     |
//! +----------+--------------+----------------------+-------------+
//! ```
//!
//! APDU frame:
//! ```text
//! +----------+--------------------------+
//! | 0x02 (1B)| COMMAND / RESPONSE BYTES |
//! +----------+--------------------------+
//! ```

use crate::error::ProtocolError;

/// Minimum length of any binary frame.
///
/// A FILE frame needs its type byte, a length byte and at least one name
/// byte; an APDU frame needs its type byte and a two-byte status word.
pub const MIN_FRAME_LENGTH: usize = 3;

/// Maximum length of a FILE name (one length byte).
pub const MAX_FILE_NAME_LENGTH: usize = u8::MAX as usize;

/// Binary frame type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// A chip file.
    File = 0x01,
    /// A relayed APDU.
    Apdu = 0x02,
}

impl FrameType {
    /// Parse frame type from byte.
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x01 => Ok(Self::File),
            0x02 => Ok(Self::Apdu),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// A validated binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryFrame {
    /// A named chip file.
    File {
        /// File name as sent on the wire.
        name: String,
        /// File content.
        data: Vec<u8>,
    },
    /// Raw APDU command or response.
    Apdu(Vec<u8>),
}

impl BinaryFrame {
    /// Create a FILE frame.
    ///
    /// # Errors
    ///
    /// Returns error if the name is empty or longer than 255 bytes.
    pub fn file(name: impl Into<String>, data: Vec<u8>) -> Result<Self, ProtocolError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ProtocolError::InvalidFileName);
        }
        if name.len() > MAX_FILE_NAME_LENGTH {
            return Err(ProtocolError::FileNameTooLong(name.len()));
        }
        Ok(Self::File { name, data })
    }

    /// Create an APDU frame.
    pub fn apdu(bytes: Vec<u8>) -> Self {
        Self::Apdu(bytes)
    }

    /// Get the frame type.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::File { .. } => FrameType::File,
            Self::Apdu(_) => FrameType::Apdu,
        }
    }

    /// Parse a frame from a complete binary WebSocket message.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Frame is shorter than [`MIN_FRAME_LENGTH`]
    /// - Type byte is unknown
    /// - FILE name length runs past the end of the frame
    /// - FILE name is not valid UTF-8
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < MIN_FRAME_LENGTH {
            return Err(ProtocolError::FrameTooShort(bytes.len()));
        }

        match FrameType::from_byte(bytes[0])? {
            FrameType::File => {
                let name_len = bytes[1] as usize;
                let rest = &bytes[2..];
                if name_len > rest.len() {
                    return Err(ProtocolError::FileNameOutOfBounds {
                        declared: name_len,
                        available: rest.len(),
                    });
                }
                let (name, data) = rest.split_at(name_len);
                let name = std::str::from_utf8(name).map_err(|_| ProtocolError::InvalidFileName)?;
                if name.is_empty() {
                    return Err(ProtocolError::InvalidFileName);
                }
                Ok(Self::File {
                    name: name.to_string(),
                    data: data.to_vec(),
                })
            }
            FrameType::Apdu => Ok(Self::Apdu(bytes[1..].to_vec())),
        }
    }

    /// Serialize to a binary WebSocket message.
    pub fn to_wire(&self) -> Vec<u8> {
        match self {
            Self::File { name, data } => {
                let mut wire = Vec::with_capacity(2 + name.len() + data.len());
                wire.push(FrameType::File.to_byte());
                // Cast is safe: constructors and parse() bound the name to 255 bytes
                #[allow(clippy::cast_possible_truncation)]
                wire.push(name.len() as u8);
                wire.extend_from_slice(name.as_bytes());
                wire.extend_from_slice(data);
                wire
            }
            Self::Apdu(bytes) => {
                let mut wire = Vec::with_capacity(1 + bytes.len());
                wire.push(FrameType::Apdu.to_byte());
                wire.extend_from_slice(bytes);
                wire
            }
        }
    }
}
