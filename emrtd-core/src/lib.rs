//! eMRTD Validation Protocol Core
//!
//! Pure protocol layer for validating an electronic identity document
//! against a remote server. No I/O happens here.
//!
//! This crate provides:
//! - Binary framing for FILE and APDU frames with strict bounds checking
//! - JSON control messages (START, ACCEPT, CA_HANDOVER, CA_HANDBACK,
//!   FINISH, RESULT, CLOSE, MONITORING)
//! - Protocol state machine with transition table and per-kind legality
//! - File identifiers and completeness validation
//! - Access keys, close codes and the validation outcome
//!
//! # Invariants
//!
//! - Exactly one protocol state at a time, full history retained
//! - A message kind is only sent or received when the state allows it
//! - A file identifier crosses the wire at most once
//! - Direct use of `unsafe` is forbidden (#![forbid(unsafe_code)])
//! - Access keys and secure messaging keys are zeroized on drop

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod access_key;
pub mod close;
pub mod error;
pub mod files;
pub mod frame;
pub mod message;
pub mod outcome;
pub mod state;

pub use access_key::{AccessKey, AccessKeyKind};
pub use close::{CloseCode, CloseReason};
pub use error::ProtocolError;
pub use files::{validate_required_files, FileId, FileSet, FileTracker};
pub use frame::{BinaryFrame, FrameType};
pub use message::{MessageKind, ProtocolMessage, SessionIdentity, WireMessage};
pub use outcome::{CheckResult, ValidationOutcome};
pub use state::{ProtocolState, StateMachine};
