//! eMRTD Connector
//!
//! Async client that validates an electronic identity document by reading
//! its chip locally and running the validation handshake with a remote
//! server over WebSocket.
//!
//! This crate wraps `emrtd-core` and provides:
//! - [`Connector`], the session coordinator (`connect`, `validate`,
//!   `start_validation`, `disconnect`, cancellation)
//! - [`MessageChannel`] and its WebSocket implementation
//! - [`ChipReader`], the contract for the local chip-reading collaborator
//! - Error taxonomy with categories, retryability and recovery hints
//! - Progress and monitoring observers
//!
//! # Failure Handling
//!
//! - **One Failure**: the first session failure is latched, every waiter
//!   resolves with it and the session moves to `failed`.
//! - **No False Success**: the chip reader is signalled success only after
//!   every mandatory and requested file is present.
//! - **Serialized Handling**: inbound frames are applied one at a time, in
//!   order, under one lock.
//! - **Implicit Cleanup**: `Drop` fails pending waits and invalidates any
//!   live chip session.
//!
//! # Example
//!
//! ```no_run
//! # use emrtd_connector::{Connector, ConnectorConfig, ChipReader};
//! # use emrtd_core::AccessKey;
//! # async fn run(reader: impl ChipReader) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectorConfig::new("wss://validator.example/ws1/validate", "validation-id", "client-id");
//! let connector = Connector::websocket(config, reader);
//! let key = AccessKey::can("123456")?;
//! if let Some(outcome) = connector.validate(&key).await? {
//!     println!("valid: {}", outcome.is_valid());
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod channel;
pub mod chip;
pub mod config;
pub mod error;
pub mod pending;
pub mod retry;
pub mod session;
pub mod status;
pub mod websocket;

pub use channel::{ChannelEvent, MessageChannel};
pub use chip::{
    ChipError, ChipHandover, ChipReadRequest, ChipReadResult, ChipReader, ChipSessionEnd,
    HandoverParameters, ReadOptions,
};
pub use config::ConnectorConfig;
pub use error::{ConnectorError, ErrorCategory};
pub use retry::RetryPolicy;
pub use session::{CancelHandle, Connector, APDU_NACK};
pub use status::{status_text, StatusContext, ValidationStep};
pub use websocket::WebSocketChannel;
