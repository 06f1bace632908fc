use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::errors::ConnectError;
use crate::model::{ReceiverId, SessionId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndReason {
    /// `disconnect()` was called.
    Requested,
    ReceiverTerminated(String),
    SuspendTimeout,
    /// Replaced by a connect to another receiver.
    Superseded,
    Shutdown,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Requested => f.write_str("requested"),
            EndReason::ReceiverTerminated(reason) => write!(f, "receiver terminated: {reason}"),
            EndReason::SuspendTimeout => f.write_str("suspension timed out"),
            EndReason::Superseded => f.write_str("superseded"),
            EndReason::Shutdown => f.write_str("controller shutdown"),
        }
    }
}

/// Lifecycle notifications, one per session transition.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Started {
        session: SessionId,
        receiver: ReceiverId,
    },
    Suspended {
        session: SessionId,
        reason: String,
    },
    Resumed {
        session: SessionId,
    },
    Ended {
        session: SessionId,
        reason: EndReason,
    },
    StartFailed {
        receiver: ReceiverId,
        error: ConnectError,
    },
}

/// Fan-out of [`SessionEvent`]s to every subscriber.
///
/// Delivery happens under the subscriber lock, so a subscriber registered
/// before a broadcast starts sees it exactly once and one registered during
/// it does not see it at all. Dropping the receiver unsubscribes.
#[derive(Clone, Default)]
pub struct SessionEventBus {
    subscribers: Arc<Mutex<Vec<Sender<SessionEvent>>>>,
}

impl SessionEventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Sender<SessionEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = unbounded::<SessionEvent>();
        self.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn broadcast(&self, event: SessionEvent) {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
