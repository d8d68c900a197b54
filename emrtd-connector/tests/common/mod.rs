//! Shared fixtures: an in-memory channel driven by a scripted server and a
//! fake chip reader.

#![allow(dead_code)]

use std::time::Duration;

use async_trait::async_trait;
use emrtd_connector::{
    ChannelEvent, ChipError, ChipHandover, ChipReadRequest, ChipReadResult, ChipReader,
    ChipSessionEnd, ConnectorConfig, ConnectorError, HandoverParameters, MessageChannel,
    RetryPolicy,
};
use emrtd_core::message::{Accept, CaHandback, Close, SecureMessagingInfo, ValidationResult};
use emrtd_core::{
    AccessKey, BinaryFrame, CheckResult, FileId, FileSet, MessageKind, ProtocolError,
    ProtocolMessage, ValidationOutcome, WireMessage,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, Notify};

pub const CHALLENGE: [u8; 8] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
pub const SIGNATURE: [u8; 4] = [0x5A, 0x5A, 0x5A, 0x5A];
pub const HANDOVER_TOKEN: u32 = 7;

pub fn config() -> ConnectorConfig {
    ConnectorConfig::new("wss://validator.test/ws1/validate", "validation-1", "client-1")
        .with_retry(RetryPolicy::none())
        .with_close_timing(Duration::from_millis(20), Duration::from_millis(20))
}

pub fn can() -> AccessKey {
    AccessKey::can("123456").unwrap()
}

pub fn outcome() -> ValidationOutcome {
    serde_json::from_value(json!({
        "passiveAuthentication": true,
        "chipAuthenticationResult": "SUCCESS",
        "activeAuthenticationResult": "SUCCESS",
        "mrzInfo": {"documentNumber": "C01X00T47"}
    }))
    .unwrap()
}

pub fn smi() -> SecureMessagingInfo {
    SecureMessagingInfo {
        cipher: "AES".into(),
        enc_key: vec![0x01; 16],
        mac_key: vec![0x02; 16],
        ssc: vec![0x00; 16],
    }
}

// --- Server events ---

pub fn message(msg: ProtocolMessage) -> ChannelEvent {
    ChannelEvent::Message(WireMessage::Text(msg))
}

pub fn accept() -> ChannelEvent {
    message(ProtocolMessage::Accept(Accept {
        active_authentication_challenge: CHALLENGE.to_vec(),
    }))
}

pub fn handback() -> ChannelEvent {
    message(ProtocolMessage::CaHandback(CaHandback {
        check_result: CheckResult::Success,
        secure_messaging_info: Some(smi()),
        dg1_data: None,
        error_message: None,
    }))
}

pub fn result() -> ChannelEvent {
    message(ProtocolMessage::Result(ValidationResult {
        passport: outcome(),
        details: None,
    }))
}

pub fn close(code: u16, reason: Option<&str>) -> ChannelEvent {
    message(ProtocolMessage::Close(Close {
        reason: reason.map(str::to_string),
        code: Some(code),
    }))
}

pub fn close_frame(code: u16) -> ChannelEvent {
    ChannelEvent::Closed {
        code: Some(code),
        reason: None,
    }
}

pub fn apdu(bytes: &[u8]) -> ChannelEvent {
    ChannelEvent::Message(WireMessage::Binary(BinaryFrame::apdu(bytes.to_vec())))
}

pub fn file(id: FileId, data: &[u8]) -> ChannelEvent {
    ChannelEvent::Message(WireMessage::Binary(
        BinaryFrame::file(id.name(), data.to_vec()).unwrap(),
    ))
}

pub fn malformed(detail: &str) -> ChannelEvent {
    ChannelEvent::Malformed(ProtocolError::MalformedMessage(detail.to_string()))
}

/// Replies of a well-behaved server to each client message.
pub fn happy_reply(sent: &WireMessage) -> Vec<ChannelEvent> {
    match sent.kind() {
        MessageKind::Start => vec![accept()],
        MessageKind::CaHandover => vec![handback()],
        MessageKind::Finish => vec![result(), close(1000, None), close_frame(1000)],
        _ => Vec::new(),
    }
}

// --- Channel ---

type Script = Box<dyn FnMut(&WireMessage) -> Vec<ChannelEvent> + Send>;

/// In-memory channel. Every sent message is recorded and answered by the
/// script; the answers are queued as if the listener had read them.
pub struct MemoryChannel {
    script: Mutex<Script>,
    events: Mutex<Option<mpsc::Sender<ChannelEvent>>>,
    sent: Mutex<Vec<WireMessage>>,
}

impl MemoryChannel {
    pub fn new(script: impl FnMut(&WireMessage) -> Vec<ChannelEvent> + Send + 'static) -> Self {
        Self {
            script: Mutex::new(Box::new(script)),
            events: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn happy() -> Self {
        Self::new(happy_reply)
    }

    pub fn sent(&self) -> Vec<WireMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_kinds(&self) -> Vec<MessageKind> {
        self.sent.lock().iter().map(WireMessage::kind).collect()
    }

    pub fn sent_files(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|msg| match msg {
                WireMessage::Binary(BinaryFrame::File { name, .. }) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn sent_apdus(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .iter()
            .filter_map(|msg| match msg {
                WireMessage::Binary(BinaryFrame::Apdu(bytes)) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn position(&self, kind: MessageKind) -> Option<usize> {
        self.sent_kinds().iter().position(|k| *k == kind)
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn connect(&self) -> Result<mpsc::Receiver<ChannelEvent>, ConnectorError> {
        let (tx, rx) = mpsc::channel(64);
        *self.events.lock() = Some(tx);
        Ok(rx)
    }

    async fn send(&self, message: WireMessage) -> Result<(), ConnectorError> {
        let tx = self
            .events
            .lock()
            .clone()
            .ok_or(ConnectorError::NotConnected)?;
        self.sent.lock().push(message.clone());
        let replies = (self.script.lock())(&message);
        for event in replies {
            let _ = tx.send(event).await;
        }
        Ok(())
    }

    async fn disconnect(&self, _code: u16, _reason: &str) {
        self.events.lock().take();
    }

    fn is_connected(&self) -> bool {
        self.events.lock().is_some()
    }
}

// --- Chip reader ---

#[derive(Debug, Clone, Default)]
pub struct ReaderLog {
    pub calls: Vec<&'static str>,
    pub challenge: Vec<u8>,
    pub handback: Option<CheckResult>,
    pub relayed: Vec<Vec<u8>>,
    pub invalidated: Option<String>,
    pub finished: Option<ChipSessionEnd>,
}

pub struct FakeChipReader {
    pub phase_one: FileSet,
    pub phase_two: FileSet,
    pub hang_in_start: bool,
    pub relay_fails: bool,
    pub started: Notify,
    log: Mutex<ReaderLog>,
}

impl FakeChipReader {
    fn with_files(phase_one: FileSet, phase_two: FileSet) -> Self {
        Self {
            phase_one,
            phase_two,
            hang_in_start: false,
            relay_fails: false,
            started: Notify::new(),
            log: Mutex::new(ReaderLog::default()),
        }
    }

    /// Chip with a security key; phase two re-reads it.
    pub fn complete_document() -> Self {
        Self::with_files(
            FileSet::new().with(FileId::DG14, vec![0x6E, 0x01]),
            FileSet::new()
                .with(FileId::DG1, vec![0x61, 0x01])
                .with(FileId::DG2, vec![0x75, 0x02])
                .with(FileId::Sod, vec![0x77, 0x03])
                .with(FileId::DG14, vec![0x6E, 0x01]),
        )
    }

    /// Chip without a security key.
    pub fn without_security_key() -> Self {
        Self::with_files(
            FileSet::new(),
            FileSet::new()
                .with(FileId::DG1, vec![0x61, 0x01])
                .with(FileId::DG2, vec![0x75, 0x02])
                .with(FileId::Sod, vec![0x77, 0x03]),
        )
    }

    /// Chip whose read breaks off before `id`.
    pub fn missing(id: FileId) -> Self {
        let mut reader = Self::complete_document();
        reader.phase_two.remove(id);
        reader
    }

    /// Chip that never finishes establishing access.
    pub fn hanging() -> Self {
        Self {
            hang_in_start: true,
            ..Self::complete_document()
        }
    }

    pub fn failing_relay() -> Self {
        Self {
            relay_fails: true,
            ..Self::complete_document()
        }
    }

    pub fn log(&self) -> ReaderLog {
        self.log.lock().clone()
    }
}

#[async_trait]
impl ChipReader for FakeChipReader {
    type Handover = u32;

    async fn start(
        &self,
        request: ChipReadRequest<'_>,
    ) -> Result<ChipHandover<Self::Handover>, ChipError> {
        {
            let mut log = self.log.lock();
            log.calls.push("start");
            log.challenge = request.challenge.to_vec();
        }
        self.started.notify_one();
        if self.hang_in_start {
            std::future::pending::<()>().await;
        }
        Ok(ChipHandover {
            state: HANDOVER_TOKEN,
            parameters: HandoverParameters {
                max_transceive_length_for_secure_messaging: 65536,
                max_block_size: 223,
                secure_messaging_info: smi(),
            },
            files: self.phase_one.clone(),
        })
    }

    async fn complete(
        &self,
        handover: Self::Handover,
        handback: CaHandback,
        _requested: &[FileId],
    ) -> Result<ChipReadResult, ChipError> {
        assert_eq!(handover, HANDOVER_TOKEN);
        {
            let mut log = self.log.lock();
            log.calls.push("complete");
            log.handback = Some(handback.check_result);
        }
        Ok(ChipReadResult {
            files: self.phase_two.clone(),
            active_authentication_signature: Some(SIGNATURE.to_vec()),
        })
    }

    async fn complete_without_ca(
        &self,
        handover: Self::Handover,
        _requested: &[FileId],
    ) -> Result<ChipReadResult, ChipError> {
        assert_eq!(handover, HANDOVER_TOKEN);
        self.log.lock().calls.push("complete_without_ca");
        Ok(ChipReadResult {
            files: self.phase_two.clone(),
            active_authentication_signature: None,
        })
    }

    async fn relay_apdu(&self, command: &[u8]) -> Result<Vec<u8>, ChipError> {
        self.log.lock().relayed.push(command.to_vec());
        if self.relay_fails {
            return Err(ChipError::SessionFailed("tag lost".into()));
        }
        Ok(vec![0x90, 0x00])
    }

    fn invalidate(&self, message: &str) {
        self.log.lock().invalidated = Some(message.to_string());
    }

    fn finish(&self, end: ChipSessionEnd) {
        self.log.lock().finished = Some(end);
    }
}
