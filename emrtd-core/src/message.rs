//! Wire messages.
//!
//! Control messages travel as JSON text frames tagged by `type`. Chip files
//! and relayed APDUs travel as binary frames tagged by their first byte
//! (see [`crate::frame`]). [`WireMessage`] unifies both.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::error::ProtocolError;
use crate::frame::BinaryFrame;
use crate::outcome::{CheckResult, ValidationOutcome};

/// Kind of a wire message, used for state legality and correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Client opens the session.
    Start,
    /// Server accepts and issues the AA challenge.
    Accept,
    /// Client hands over its secure channel for chip authentication.
    CaHandover,
    /// Server returns new secure channel parameters.
    CaHandback,
    /// Client finished reading.
    Finish,
    /// Server delivers the validation outcome.
    Result,
    /// Either side ends the session.
    Close,
    /// Client diagnostics.
    Monitoring,
    /// Binary chip file.
    File,
    /// Binary relayed APDU.
    Apdu,
}

impl MessageKind {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Accept => "ACCEPT",
            Self::CaHandover => "CA_HANDOVER",
            Self::CaHandback => "CA_HANDBACK",
            Self::Finish => "FINISH",
            Self::Result => "RESULT",
            Self::Close => "CLOSE",
            Self::Monitoring => "MONITORING",
            Self::File => "FILE",
            Self::Apdu => "APDU",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who the session belongs to. Fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    validation_id: String,
    client_id: String,
}

impl SessionIdentity {
    /// Create a new identity.
    pub fn new(validation_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            validation_id: validation_id.into(),
            client_id: client_id.into(),
        }
    }

    /// Validation id issued by the relying party.
    pub fn validation_id(&self) -> &str {
        &self.validation_id
    }

    /// Client id registered with the server.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Build the START message for this identity.
    pub fn start_message(&self, platform: &str, enable_diagnostics: bool) -> ProtocolMessage {
        ProtocolMessage::Start(Start {
            validation_id: self.validation_id.clone(),
            client_id: self.client_id.clone(),
            platform: platform.to_string(),
            nfc_adapter_supports_extended_length: true,
            enable_diagnostics,
        })
    }
}

/// Opens a validation session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Start {
    /// Validation id issued by the relying party.
    pub validation_id: String,
    /// Client id registered with the server.
    pub client_id: String,
    /// Host platform label.
    pub platform: String,
    /// Always true: the relay path supports extended-length APDUs.
    pub nfc_adapter_supports_extended_length: bool,
    /// Whether MONITORING messages will follow.
    pub enable_diagnostics: bool,
}

/// Server acceptance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Accept {
    /// Challenge to be signed during active authentication.
    #[serde(with = "base64_bytes")]
    pub active_authentication_challenge: Vec<u8>,
}

/// Secure messaging session keys and counter.
///
/// Key material is wiped on drop and never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct SecureMessagingInfo {
    /// Cipher family (`"DESede"` or `"AES"`).
    pub cipher: String,
    /// Session encryption key.
    #[serde(with = "base64_bytes")]
    pub enc_key: Vec<u8>,
    /// Session MAC key.
    #[serde(with = "base64_bytes")]
    pub mac_key: Vec<u8>,
    /// Send sequence counter.
    #[serde(with = "base64_bytes")]
    pub ssc: Vec<u8>,
}

impl fmt::Debug for SecureMessagingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureMessagingInfo")
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}

/// Hands the client's secure channel to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaHandover {
    /// Largest APDU the secure channel can carry.
    pub max_transceive_length_for_secure_messaging: u32,
    /// Block size for file reads.
    pub max_block_size: u32,
    /// Current secure channel state.
    pub secure_messaging_info: SecureMessagingInfo,
}

/// Server's answer to the handover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaHandback {
    /// Outcome of chip authentication.
    pub check_result: CheckResult,
    /// New secure channel after chip authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure_messaging_info: Option<SecureMessagingInfo>,
    /// DG1 as read by the server, if it read it.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub dg1_data: Option<Vec<u8>>,
    /// Server-side error description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Client finished reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finish {
    /// Whether the server should answer with RESULT.
    pub send_result: bool,
    /// Signature over the AA challenge. Always serialized, `null` if absent.
    #[serde(default, with = "base64_opt")]
    pub active_authentication_signature: Option<Vec<u8>>,
}

/// Validation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    /// Structured outcome.
    pub passport: ValidationOutcome,
    /// Extra server details, kept as a JSON string.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "json_as_string"
    )]
    pub details: Option<String>,
}

/// Session end.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Close {
    /// Machine-readable reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Close code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

/// Client diagnostics line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Monitoring {
    /// Free-form text.
    pub message: String,
}

/// JSON control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProtocolMessage {
    /// START
    #[serde(rename = "START")]
    Start(Start),
    /// ACCEPT
    #[serde(rename = "ACCEPT")]
    Accept(Accept),
    /// CA_HANDOVER
    #[serde(rename = "CA_HANDOVER")]
    CaHandover(CaHandover),
    /// CA_HANDBACK
    #[serde(rename = "CA_HANDBACK")]
    CaHandback(CaHandback),
    /// FINISH
    #[serde(rename = "FINISH")]
    Finish(Finish),
    /// RESULT
    #[serde(rename = "RESULT")]
    Result(ValidationResult),
    /// CLOSE
    #[serde(rename = "CLOSE")]
    Close(Close),
    /// MONITORING
    #[serde(rename = "MONITORING")]
    Monitoring(Monitoring),
}

impl ProtocolMessage {
    /// Kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Start(_) => MessageKind::Start,
            Self::Accept(_) => MessageKind::Accept,
            Self::CaHandover(_) => MessageKind::CaHandover,
            Self::CaHandback(_) => MessageKind::CaHandback,
            Self::Finish(_) => MessageKind::Finish,
            Self::Result(_) => MessageKind::Result,
            Self::Close(_) => MessageKind::Close,
            Self::Monitoring(_) => MessageKind::Monitoring,
        }
    }

    /// Parse a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Any message on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// JSON text frame.
    Text(ProtocolMessage),
    /// Type-tagged binary frame.
    Binary(BinaryFrame),
}

/// Encoded form ready for the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedFrame {
    /// Text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
}

impl WireMessage {
    /// Kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text(msg) => msg.kind(),
            Self::Binary(BinaryFrame::File { .. }) => MessageKind::File,
            Self::Binary(BinaryFrame::Apdu(_)) => MessageKind::Apdu,
        }
    }

    /// Decode a text frame.
    pub fn decode_text(text: &str) -> Result<Self, ProtocolError> {
        ProtocolMessage::from_json(text).map(Self::Text)
    }

    /// Decode a binary frame.
    pub fn decode_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        BinaryFrame::parse(bytes).map(Self::Binary)
    }

    /// Encode for the socket.
    pub fn encode(&self) -> Result<EncodedFrame, ProtocolError> {
        match self {
            Self::Text(msg) => msg.to_json().map(EncodedFrame::Text),
            Self::Binary(frame) => Ok(EncodedFrame::Binary(frame.to_wire())),
        }
    }
}

impl From<ProtocolMessage> for WireMessage {
    fn from(msg: ProtocolMessage) -> Self {
        Self::Text(msg)
    }
}

impl From<BinaryFrame> for WireMessage {
    fn from(frame: BinaryFrame) -> Self {
        Self::Binary(frame)
    }
}

/// Keep whatever JSON the server put in `details` as a string.
fn json_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

mod base64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}
