//! Protocol state machine.
//!
//! States: INITIAL → CONNECTED → STARTED → ACCEPTED → READING_CHIP →
//! HANDOVER_SENT → HANDBACK_RECEIVED → FINISHING → COMPLETED → CLOSED
//!
//! READING_CHIP may jump straight to FINISHING when the chip has no
//! security-key file. Every non-terminal state may fail or close.
//! ACCEPTED auto-advances to READING_CHIP.

use std::fmt;
use std::time::{Duration, Instant};

use crate::error::ProtocolError;
use crate::message::MessageKind;

/// Budget for the connect phase.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for START → ACCEPT.
pub const START_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for a chip-reader phase.
pub const CHIP_READ_TIMEOUT: Duration = Duration::from_secs(20);

/// Budget for CA_HANDOVER → CA_HANDBACK.
pub const HANDOVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for FINISH → RESULT.
pub const FINISH_TIMEOUT: Duration = Duration::from_secs(60);

/// Budget for every other state.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Session state enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    /// Nothing happened yet.
    Initial,
    /// Channel is being opened.
    Connecting,
    /// Channel is open.
    Connected,
    /// START sent, waiting for ACCEPT.
    Started,
    /// ACCEPT received.
    Accepted,
    /// Chip reader is working.
    ReadingChip,
    /// CA_HANDOVER sent, waiting for CA_HANDBACK.
    HandoverSent,
    /// CA_HANDBACK received.
    HandbackReceived,
    /// FINISH sent, waiting for RESULT.
    Finishing,
    /// RESULT received (or fire-and-forget close observed).
    Completed,
    /// Session failed.
    Failed,
    /// Session closed. Final state.
    Closed,
}

impl ProtocolState {
    /// Every state, in protocol order.
    pub const ALL: [ProtocolState; 12] = [
        Self::Initial,
        Self::Connecting,
        Self::Connected,
        Self::Started,
        Self::Accepted,
        Self::ReadingChip,
        Self::HandoverSent,
        Self::HandbackReceived,
        Self::Finishing,
        Self::Completed,
        Self::Failed,
        Self::Closed,
    ];

    /// States reachable in one step.
    pub fn allowed_transitions(self) -> &'static [ProtocolState] {
        use ProtocolState::*;
        match self {
            Initial | Connecting => &[Connected, Failed],
            Connected => &[Started, Closed, Failed],
            Started => &[Accepted, Closed, Failed],
            Accepted => &[ReadingChip, Closed, Failed],
            ReadingChip => &[HandoverSent, Finishing, Closed, Failed],
            HandoverSent => &[HandbackReceived, Closed, Failed],
            HandbackReceived => &[Finishing, Closed, Failed],
            Finishing => &[Completed, Closed, Failed],
            Completed => &[Closed],
            Failed => &[Closed],
            Closed => &[],
        }
    }

    /// Whether `to` is reachable in one step.
    pub fn can_transition_to(self, to: ProtocolState) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// State entered immediately after this one without caller action.
    pub fn auto_advance(self) -> Option<ProtocolState> {
        match self {
            Self::Accepted => Some(Self::ReadingChip),
            _ => None,
        }
    }

    /// Completed, failed or closed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Closed)
    }

    /// Between START and RESULT.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Started
                | Self::Accepted
                | Self::ReadingChip
                | Self::HandoverSent
                | Self::HandbackReceived
                | Self::Finishing
        )
    }

    /// Advisory time budget for this state.
    pub fn timeout(self) -> Duration {
        match self {
            Self::Connecting => CONNECT_TIMEOUT,
            Self::Started => START_TIMEOUT,
            Self::ReadingChip => CHIP_READ_TIMEOUT,
            Self::HandoverSent => HANDOVER_TIMEOUT,
            Self::Finishing => FINISH_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Whether the client may send `kind` in this state.
    pub fn can_send(self, kind: MessageKind) -> bool {
        use ProtocolState::*;
        match kind {
            MessageKind::Start => self == Connected,
            MessageKind::CaHandover => self == ReadingChip,
            MessageKind::Finish => matches!(self, HandbackReceived | ReadingChip),
            MessageKind::File => matches!(self, ReadingChip | HandbackReceived),
            MessageKind::Apdu => matches!(self, ReadingChip | HandoverSent),
            MessageKind::Close | MessageKind::Monitoring => !self.is_terminal(),
            MessageKind::Accept | MessageKind::CaHandback | MessageKind::Result => false,
        }
    }

    /// Whether the client may receive `kind` in this state.
    pub fn can_receive(self, kind: MessageKind) -> bool {
        use ProtocolState::*;
        match kind {
            MessageKind::Accept => self == Started,
            MessageKind::CaHandback => self == HandoverSent,
            MessageKind::Result => self == Finishing,
            MessageKind::Apdu => matches!(self, ReadingChip | HandoverSent),
            MessageKind::File => matches!(self, ReadingChip | HandoverSent | HandbackReceived),
            MessageKind::Close => !self.is_terminal(),
            MessageKind::Start
            | MessageKind::CaHandover
            | MessageKind::Finish
            | MessageKind::Monitoring => false,
        }
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "initial",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Started => "started",
            Self::Accepted => "accepted",
            Self::ReadingChip => "readingChip",
            Self::HandoverSent => "handoverSent",
            Self::HandbackReceived => "handbackReceived",
            Self::Finishing => "finishing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One recorded transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Previous state.
    pub from: ProtocolState,
    /// New state.
    pub to: ProtocolState,
    /// When it happened.
    pub at: Instant,
}

/// Holds exactly one current state plus the full transition history.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: ProtocolState,
    history: Vec<Transition>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Start in `Initial`.
    pub fn new() -> Self {
        Self {
            state: ProtocolState::Initial,
            history: Vec::new(),
        }
    }

    /// Get current state.
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Transition history, oldest first.
    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Move to `to`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if `to` is not in the allowed set.
    pub fn transition(&mut self, to: ProtocolState) -> Result<(), ProtocolError> {
        if !self.state.can_transition_to(to) {
            return Err(ProtocolError::InvalidState {
                current: self.state,
                requested: to,
            });
        }
        self.history.push(Transition {
            from: self.state,
            to,
            at: Instant::now(),
        });
        self.state = to;
        Ok(())
    }

    /// Move to `to`, then follow any auto-advance chain.
    ///
    /// Returns the state finally reached.
    pub fn advance(&mut self, to: ProtocolState) -> Result<ProtocolState, ProtocolError> {
        self.transition(to)?;
        while let Some(next) = self.state.auto_advance() {
            self.transition(next)?;
        }
        Ok(self.state)
    }

    /// Move to `Failed` unless already terminal.
    ///
    /// Returns whether the state changed.
    pub fn fail(&mut self) -> bool {
        self.transition(ProtocolState::Failed).is_ok()
    }

    /// Check that `kind` may be sent now.
    pub fn validate_send(&self, kind: MessageKind) -> Result<(), ProtocolError> {
        if self.state.can_send(kind) {
            Ok(())
        } else {
            Err(ProtocolError::IllegalSend {
                kind,
                state: self.state,
            })
        }
    }

    /// Check that `kind` may be received now.
    pub fn validate_receive(&self, kind: MessageKind) -> Result<(), ProtocolError> {
        if self.state.can_receive(kind) {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedMessage {
                kind,
                state: self.state,
            })
        }
    }
}
