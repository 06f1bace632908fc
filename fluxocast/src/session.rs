//! Session lifecycle state machine.
//!
//! The machine is pure: it is fed [`SessionInput`]s together with the current
//! instant and answers with the [`Transition`] it applied. Side effects
//! (network calls, event fan-out, failing commands) belong to the actor that
//! owns it.
//!
//! ```text
//! Disconnected/Ended ──connect──▶ Connecting ──ok──▶ Connected ◀──resume── Suspended
//!                                     │                 │ │                  │  │
//!                                  failure              │ └──transient loss──┘  │
//!                                     ▼                 ▼                      │
//!                                Disconnected         Ending ◀───disconnect────┘
//!                                                       │        suspend timeout
//!                                                       ▼               │
//!                                                     Ended ◀───────────┘
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;

use crate::model::{ReceiverId, Session, SessionHandle, SessionState};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionInput {
    ConnectRequested { receiver: ReceiverId },
    ConnectSucceeded(SessionHandle),
    ConnectFailed,
    TransientLoss,
    Resumed,
    DisconnectRequested,
    ReceiverTerminated,
    EndingComplete,
    SuspendTimeout,
}

impl SessionInput {
    pub fn name(&self) -> &'static str {
        match self {
            SessionInput::ConnectRequested { .. } => "connect_requested",
            SessionInput::ConnectSucceeded(_) => "connect_succeeded",
            SessionInput::ConnectFailed => "connect_failed",
            SessionInput::TransientLoss => "transient_loss",
            SessionInput::Resumed => "resumed",
            SessionInput::DisconnectRequested => "disconnect_requested",
            SessionInput::ReceiverTerminated => "receiver_terminated",
            SessionInput::EndingComplete => "ending_complete",
            SessionInput::SuspendTimeout => "suspend_timeout",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("input '{input}' is not valid in state {state}")]
pub struct InvalidTransition {
    pub state: SessionState,
    pub input: &'static str,
}

/// What an expired deadline means in the current state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeadlineKind {
    Connect,
    Suspend,
}

#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    session: Option<Session>,
    target: Option<ReceiverId>,
    deadline: Option<Instant>,
    connect_timeout: Duration,
    suspend_timeout: Duration,
}

impl SessionStateMachine {
    pub fn new(connect_timeout: Duration, suspend_timeout: Duration) -> Self {
        Self {
            state: SessionState::Disconnected,
            session: None,
            target: None,
            deadline: None,
            connect_timeout,
            suspend_timeout,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The current session, if one was established. Still returned once
    /// Ended, until the next connect supersedes it.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Receiver targeted by the pending connect attempt.
    pub fn target(&self) -> Option<&ReceiverId> {
        self.target.as_ref()
    }

    /// Deadline of the Connecting or Suspended state.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns which deadline expired, if any, at `now`.
    pub fn expired(&self, now: Instant) -> Option<DeadlineKind> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        match self.state {
            SessionState::Connecting => Some(DeadlineKind::Connect),
            SessionState::Suspended => Some(DeadlineKind::Suspend),
            _ => None,
        }
    }

    /// Records receiver activity on the current session.
    pub fn touch(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.last_activity_at = Utc::now();
        }
    }

    pub fn apply(
        &mut self,
        input: SessionInput,
        now: Instant,
    ) -> Result<Transition, InvalidTransition> {
        use SessionState::*;

        let from = self.state;
        let to = match (from, &input) {
            (Disconnected | Ended, SessionInput::ConnectRequested { .. }) => Connecting,
            (Connecting, SessionInput::ConnectSucceeded(_)) => Connected,
            (Connecting, SessionInput::ConnectFailed) => Disconnected,
            (Connected, SessionInput::TransientLoss) => Suspended,
            (Suspended, SessionInput::Resumed) => Connected,
            (Suspended, SessionInput::SuspendTimeout) => Ended,
            (
                Connected | Suspended,
                SessionInput::DisconnectRequested | SessionInput::ReceiverTerminated,
            ) => Ending,
            (Ending, SessionInput::EndingComplete) => Ended,
            _ => {
                return Err(InvalidTransition {
                    state: from,
                    input: input.name(),
                });
            }
        };

        match input {
            SessionInput::ConnectRequested { receiver } => {
                self.session = None;
                self.target = Some(receiver);
                self.deadline = Some(now + self.connect_timeout);
            }
            SessionInput::ConnectSucceeded(handle) => {
                let at = Utc::now();
                self.session = Some(Session {
                    id: handle.id,
                    receiver: handle.receiver,
                    state: to,
                    started_at: at,
                    last_activity_at: at,
                });
                self.target = None;
                self.deadline = None;
            }
            SessionInput::ConnectFailed => {
                self.target = None;
                self.deadline = None;
            }
            SessionInput::TransientLoss => {
                self.deadline = Some(now + self.suspend_timeout);
            }
            _ => {
                self.deadline = None;
            }
        }

        self.state = to;
        if let Some(session) = self.session.as_mut() {
            session.state = to;
            session.last_activity_at = Utc::now();
        }

        Ok(Transition { from, to })
    }
}
