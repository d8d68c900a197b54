//! Scripted eMRTD validation server.
//!
//! Speaks the server half of the validation protocol over WebSocket, well
//! enough to drive a client through START, FILE intake, chip authentication
//! with one relayed APDU, FINISH and RESULT. Each connection follows the
//! [`ServerScript`]; what the client sent is kept as a [`SessionRecord`].

use std::net::SocketAddr;
use std::sync::Arc;

use emrtd_core::message::{
    Accept, CaHandback, Close, SecureMessagingInfo, Start, ValidationResult,
};
use emrtd_core::{
    BinaryFrame, CheckResult, CloseCode, CloseReason, MessageKind, ProtocolMessage,
    ValidationOutcome,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How the server treats a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Full successful handshake.
    Normal,
    /// Chip access control fails when the client hands over.
    RejectAccess,
    /// START carries an unknown client id.
    InvalidClient,
    /// Connection drops right after ACCEPT, without a close frame.
    DropAfterAccept,
}

/// Per-connection script.
#[derive(Debug, Clone)]
pub struct ServerScript {
    /// Behaviour for every connection.
    pub behavior: Behavior,
    /// AA challenge sent in ACCEPT.
    pub challenge: Vec<u8>,
    /// APDU pushed to the client after CA_HANDOVER. `None` answers the
    /// handover straight away.
    pub relay_apdu: Option<Vec<u8>>,
    /// Outcome sent in RESULT.
    pub outcome: ValidationOutcome,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self {
            behavior: Behavior::Normal,
            challenge: vec![0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6, 0x07, 0x18],
            relay_apdu: Some(vec![0x0C, 0xB0, 0x00, 0x00, 0x00]),
            outcome: default_outcome(),
        }
    }
}

impl ServerScript {
    /// Script with the given behaviour.
    pub fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            ..Self::default()
        }
    }
}

/// Outcome of a genuine document.
pub fn default_outcome() -> ValidationOutcome {
    serde_json::from_value(json!({
        "passiveAuthentication": true,
        "chipAuthenticationResult": "SUCCESS",
        "activeAuthenticationResult": "SUCCESS",
        "mrzInfo": {
            "documentNumber": "C01X00T47",
            "dateOfBirth": "640812",
            "dateOfExpiry": "310101"
        }
    }))
    .expect("static outcome is well formed")
}

/// What one client did during its session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionRecord {
    /// START as received.
    pub start: Option<Start>,
    /// Every inbound kind, in order.
    pub received: Vec<MessageKind>,
    /// FILE names, in order.
    pub files: Vec<String>,
    /// APDUs the client sent back.
    pub apdu_responses: Vec<Vec<u8>>,
    /// MONITORING lines.
    pub monitoring: Vec<String>,
    /// Whether FINISH asked for a RESULT.
    pub result_requested: Option<bool>,
    /// AA signature from FINISH.
    pub signature: Option<Vec<u8>>,
}

/// Records of finished sessions.
pub type Records = Arc<Mutex<Vec<SessionRecord>>>;

/// Accept connections on `listener` until it fails.
pub async fn run_server(listener: TcpListener, script: ServerScript) {
    run_server_with_records(listener, script, Records::default()).await;
}

/// [`run_server`], keeping a record of every session in `records`.
pub async fn run_server_with_records(
    listener: TcpListener,
    script: ServerScript,
    records: Records,
) {
    let script = Arc::new(script);
    while let Ok((stream, peer)) = listener.accept().await {
        let script = Arc::clone(&script);
        let records = Arc::clone(&records);
        tokio::spawn(async move {
            let mut record = SessionRecord::default();
            if let Err(e) = handle_connection(stream, &script, &mut record).await {
                debug!(%peer, error = %e, "connection ended with error");
            }
            records.lock().push(record);
        });
    }
}

/// A server running in the background on a loopback port.
#[derive(Debug)]
pub struct TestServer {
    addr: SocketAddr,
    records: Records,
}

impl TestServer {
    /// Bind to an ephemeral loopback port and start serving.
    pub async fn spawn(script: ServerScript) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let records = Records::default();
        tokio::spawn(run_server_with_records(
            listener,
            script,
            Arc::clone(&records),
        ));
        Ok(Self { addr, records })
    }

    /// `ws://` URL of the server.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Records of sessions that have ended.
    pub fn records(&self) -> Vec<SessionRecord> {
        self.records.lock().clone()
    }
}

fn secure_messaging_info() -> SecureMessagingInfo {
    SecureMessagingInfo {
        cipher: "AES".into(),
        enc_key: vec![0x11; 16],
        mac_key: vec![0x22; 16],
        ssc: vec![0x00; 16],
    }
}

async fn send(sink: &mut WsSink, message: ProtocolMessage) -> Result<(), BoxError> {
    sink.send(Message::Text(message.to_json()?)).await?;
    Ok(())
}

/// Send CLOSE, then the matching transport close frame.
async fn close(
    sink: &mut WsSink,
    reason: Option<CloseReason>,
    code: CloseCode,
) -> Result<(), BoxError> {
    let reason_text = reason.as_ref().map(|r| r.as_str().to_string());
    send(
        sink,
        ProtocolMessage::Close(Close {
            reason: reason_text.clone(),
            code: Some(code.as_u16()),
        }),
    )
    .await?;
    sink.send(Message::Close(Some(CloseFrame {
        code: WsCloseCode::from(code.as_u16()),
        reason: reason_text.unwrap_or_default().into(),
    })))
    .await?;
    Ok(())
}

/// Close with `reason` and its expected code.
async fn reject(sink: &mut WsSink, reason: CloseReason) -> Result<(), BoxError> {
    let code = reason.expected_code();
    close(sink, Some(reason), code).await
}

async fn handle_connection(
    stream: TcpStream,
    script: &ServerScript,
    record: &mut SessionRecord,
) -> Result<(), BoxError> {
    let ws = accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();
    let mut awaiting_apdu = false;

    while let Some(message) = stream.next().await {
        match message? {
            Message::Text(text) => {
                let message = match ProtocolMessage::from_json(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "undecodable message");
                        reject(&mut sink, CloseReason::UnexpectedMessage).await?;
                        return Ok(());
                    }
                };
                record.received.push(message.kind());
                debug!(kind = %message.kind(), "received");
                match message {
                    ProtocolMessage::Start(start) => {
                        record.start = Some(start);
                        if script.behavior == Behavior::InvalidClient {
                            reject(&mut sink, CloseReason::InvalidClientId).await?;
                            return Ok(());
                        }
                        send(
                            &mut sink,
                            ProtocolMessage::Accept(Accept {
                                active_authentication_challenge: script.challenge.clone(),
                            }),
                        )
                        .await?;
                        if script.behavior == Behavior::DropAfterAccept {
                            info!("dropping connection after ACCEPT");
                            return Ok(());
                        }
                    }
                    ProtocolMessage::CaHandover(_) => {
                        if script.behavior == Behavior::RejectAccess {
                            reject(&mut sink, CloseReason::AccessControlFailed).await?;
                            return Ok(());
                        }
                        match &script.relay_apdu {
                            Some(apdu) => {
                                let frame = BinaryFrame::apdu(apdu.clone()).to_wire();
                                sink.send(Message::Binary(frame)).await?;
                                awaiting_apdu = true;
                            }
                            None => send(&mut sink, handback()).await?,
                        }
                    }
                    ProtocolMessage::Finish(finish) => {
                        record.result_requested = Some(finish.send_result);
                        record.signature = finish.active_authentication_signature;
                        if finish.send_result {
                            send(
                                &mut sink,
                                ProtocolMessage::Result(ValidationResult {
                                    passport: script.outcome.clone(),
                                    details: None,
                                }),
                            )
                            .await?;
                        }
                        close(&mut sink, None, CloseCode::Normal).await?;
                        return Ok(());
                    }
                    ProtocolMessage::Monitoring(monitoring) => {
                        record.monitoring.push(monitoring.message);
                    }
                    ProtocolMessage::Close(_) => return Ok(()),
                    other => {
                        warn!(kind = %other.kind(), "unexpected message");
                        reject(&mut sink, CloseReason::UnexpectedMessage).await?;
                        return Ok(());
                    }
                }
            }
            Message::Binary(bytes) => match BinaryFrame::parse(&bytes)? {
                BinaryFrame::File { name, .. } => {
                    record.received.push(MessageKind::File);
                    record.files.push(name);
                }
                BinaryFrame::Apdu(response) => {
                    record.received.push(MessageKind::Apdu);
                    record.apdu_responses.push(response);
                    if awaiting_apdu {
                        awaiting_apdu = false;
                        send(&mut sink, handback()).await?;
                    }
                }
            },
            Message::Close(_) => return Ok(()),
            // Pongs are queued by the library and flushed on the next read.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
    Ok(())
}

fn handback() -> ProtocolMessage {
    ProtocolMessage::CaHandback(CaHandback {
        check_result: CheckResult::Success,
        secure_messaging_info: Some(secure_messaging_info()),
        dg1_data: None,
        error_message: None,
    })
}
