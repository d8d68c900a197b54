//! WebSocket message channel.
//!
//! # Frame Handling Invariants
//!
//! - Strict 1:1 mapping: one WS text or binary message = one [`WireMessage`]
//! - No buffering, no message combining/splitting
//! - Each `send()` = exactly one `sink.send(..)`
//! - The listener re-arms after every frame until the stream ends, so a close
//!   frame that trails the last data frame is still delivered

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use emrtd_core::message::EncodedFrame;
use emrtd_core::WireMessage;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

use crate::channel::{ChannelEvent, MessageChannel, EVENT_QUEUE_DEPTH};
use crate::config::ConnectorConfig;
use crate::error::ConnectorError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Payload of the liveness probe ping.
const PROBE_PAYLOAD: &[u8] = b"emrtd-probe";

/// WebSocket implementation of [`MessageChannel`].
///
/// Does not implement `Clone` to prevent socket duplication.
pub struct WebSocketChannel {
    url: String,
    headers: Vec<(String, String)>,
    probe_timeout: Duration,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    connected: Arc<AtomicBool>,
    listener: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WebSocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Header values may carry credentials.
        f.debug_struct("WebSocketChannel")
            .field("url", &self.url)
            .field("headers", &self.headers.len())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl WebSocketChannel {
    /// Create an unconnected channel.
    pub fn new(url: impl Into<String>, headers: Vec<(String, String)>, probe_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            headers,
            probe_timeout,
            sink: tokio::sync::Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            listener: parking_lot::Mutex::new(None),
        }
    }

    /// Create an unconnected channel for `config`.
    pub fn from_config(config: &ConnectorConfig) -> Self {
        Self::new(
            config.server_url.clone(),
            config.http_headers.clone(),
            config.probe_timeout,
        )
    }

    async fn open(&self) -> Result<WsStream, ConnectorError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))?;
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ConnectorError::ConnectionFailed(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ConnectorError::ConnectionFailed(format!("header {name}: {e}")))?;
            request.headers_mut().append(name, value);
        }

        let (ws, _response) = connect_async(request).await.map_err(connect_error)?;
        Ok(ws)
    }

    /// Ping the server and wait for the pong.
    ///
    /// Frames that arrive before the pong are returned so they can be
    /// delivered ahead of everything the listener reads.
    async fn probe(
        &self,
        sink: &mut WsSink,
        stream: &mut SplitStream<WsStream>,
    ) -> Result<Vec<WsMessage>, ConnectorError> {
        sink.send(WsMessage::Ping(PROBE_PAYLOAD.to_vec()))
            .await
            .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))?;

        let mut early = Vec::new();
        let wait = async {
            loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Pong(_))) => return Ok(()),
                    Some(Ok(other)) => early.push(other),
                    Some(Err(e)) => return Err(ConnectorError::Receive(e.to_string())),
                    None => {
                        return Err(ConnectorError::ConnectionFailed(
                            "connection closed during liveness probe".into(),
                        ))
                    }
                }
            }
        };
        tokio::time::timeout(self.probe_timeout, wait)
            .await
            .map_err(|_| ConnectorError::ConnectionFailed("liveness probe timed out".into()))??;
        Ok(early)
    }
}

/// Map a failed handshake onto a connector error.
fn connect_error(e: WsError) -> ConnectorError {
    match &e {
        WsError::Io(io)
            if matches!(
                io.kind(),
                ErrorKind::NetworkUnreachable | ErrorKind::NetworkDown | ErrorKind::HostUnreachable
            ) =>
        {
            ConnectorError::NoNetwork
        }
        _ => ConnectorError::ConnectionFailed(e.to_string()),
    }
}

/// Translate one WebSocket message into a channel event.
///
/// Control frames other than close produce nothing.
fn event_for(message: WsMessage) -> Option<ChannelEvent> {
    match message {
        WsMessage::Text(text) => Some(match WireMessage::decode_text(&text) {
            Ok(msg) => ChannelEvent::Message(msg),
            Err(e) => ChannelEvent::Malformed(e),
        }),
        WsMessage::Binary(bytes) => Some(match WireMessage::decode_binary(&bytes) {
            Ok(msg) => ChannelEvent::Message(msg),
            Err(e) => ChannelEvent::Malformed(e),
        }),
        WsMessage::Close(frame) => Some(ChannelEvent::Closed {
            code: frame.as_ref().map(|f| u16::from(f.code)),
            reason: frame
                .map(|f| f.reason.into_owned())
                .filter(|reason| !reason.is_empty()),
        }),
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => None,
    }
}

async fn listen(
    mut stream: SplitStream<WsStream>,
    events: mpsc::Sender<ChannelEvent>,
    connected: Arc<AtomicBool>,
) {
    let last = loop {
        match stream.next().await {
            Some(Ok(message)) => {
                if let Some(event) = event_for(message) {
                    if let ChannelEvent::Message(msg) = &event {
                        debug!(kind = %msg.kind(), "frame received");
                    }
                    if events.send(event).await.is_err() {
                        // Nobody is listening any more.
                        break None;
                    }
                }
            }
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                break Some(ChannelEvent::Disconnected(None));
            }
            Some(Err(e)) => break Some(ChannelEvent::Disconnected(Some(e.to_string()))),
        }
    };
    connected.store(false, Ordering::SeqCst);
    if let Some(event) = last {
        let _ = events.send(event).await;
    }
}

#[async_trait]
impl MessageChannel for WebSocketChannel {
    async fn connect(&self) -> Result<mpsc::Receiver<ChannelEvent>, ConnectorError> {
        if self.is_connected() {
            return Err(ConnectorError::ConnectionFailed("already connected".into()));
        }

        let ws = self.open().await?;
        let (mut sink, mut stream) = ws.split();
        let early = self.probe(&mut sink, &mut stream).await?;

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        for event in early.into_iter().filter_map(event_for) {
            let _ = tx.send(event).await;
        }

        *self.sink.lock().await = Some(sink);
        self.connected.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(listen(stream, tx, Arc::clone(&self.connected)));
        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
        debug!(url = %self.url, "channel connected");
        Ok(rx)
    }

    async fn send(&self, message: WireMessage) -> Result<(), ConnectorError> {
        let kind = message.kind();
        let ws_message = match message
            .encode()
            .map_err(|e| ConnectorError::Send(e.to_string()))?
        {
            EncodedFrame::Text(text) => WsMessage::Text(text),
            EncodedFrame::Binary(bytes) => WsMessage::Binary(bytes),
        };

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(ConnectorError::NotConnected)?;
        sink.send(ws_message)
            .await
            .map_err(|e| ConnectorError::Send(e.to_string()))?;
        debug!(%kind, "frame sent");
        Ok(())
    }

    async fn disconnect(&self, code: u16, reason: &str) {
        let Some(mut sink) = self.sink.lock().await.take() else {
            return;
        };
        self.connected.store(false, Ordering::SeqCst);
        let frame = CloseFrame {
            code: WsCloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        // Best effort: the peer may already be gone.
        if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
            debug!(error = %e, "close frame not delivered");
        }
        if let Err(e) = sink.close().await {
            debug!(error = %e, "sink close failed");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            if !handle.is_finished() {
                warn!("channel dropped while listening");
            }
            handle.abort();
        }
    }
}
