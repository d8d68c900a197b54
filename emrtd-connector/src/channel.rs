//! Message channel contract.
//!
//! A channel is a reliable, ordered, duplex connection to the validation
//! server. Inbound frames are delivered by an independently scheduled
//! listener into an event queue; the coordinator drains that queue one
//! event at a time.

use async_trait::async_trait;
use emrtd_core::{ProtocolError, WireMessage};
use tokio::sync::mpsc;

use crate::error::ConnectorError;

/// Depth of the inbound event queue.
pub const EVENT_QUEUE_DEPTH: usize = 64;

/// Something the listener observed on the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A decoded inbound frame.
    Message(WireMessage),
    /// An inbound frame that failed to decode.
    Malformed(ProtocolError),
    /// The peer sent a transport-level close frame.
    Closed {
        /// Close code, if any.
        code: Option<u16>,
        /// Close reason, if any.
        reason: Option<String>,
    },
    /// The connection is gone. No further events follow.
    Disconnected(Option<String>),
}

/// Duplex connection to the validation server.
///
/// Implementations use interior mutability so the coordinator can send from
/// its main flow and from the APDU relay path.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Open the connection and start the listener.
    ///
    /// Fails with `ConnectionFailed` unless a liveness probe confirms the
    /// link. Returns the queue the listener feeds. The listener keeps
    /// reading after every delivered frame so trailing close frames are
    /// still observed.
    async fn connect(&self) -> Result<mpsc::Receiver<ChannelEvent>, ConnectorError>;

    /// Send one message.
    ///
    /// Fails with `NotConnected` if closed, `Send` on write failure.
    async fn send(&self, message: WireMessage) -> Result<(), ConnectorError>;

    /// Close the connection. Idempotent and best-effort.
    async fn disconnect(&self, code: u16, reason: &str);

    /// Whether the connection is open.
    fn is_connected(&self) -> bool;
}
