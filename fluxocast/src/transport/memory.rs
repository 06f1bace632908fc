//! In-memory transport adapter.
//!
//! `MemoryTransport` plays the receiver side without any network: connect and
//! send outcomes can be scripted, every send attempt is recorded, and receiver
//! events are injected with [`MemoryTransport::push`]. It backs the test-suite
//! and the bundled demo.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::debug;
use uuid::Uuid;

use crate::errors::{ConnectError, TransportError};
use crate::model::{
    Ack, CommandKind, ReceiverDescriptor, ReceiverEvent, ReceiverId, SessionHandle, SessionId,
};
use crate::transport::TransportAdapter;

/// One recorded `send` call.
#[derive(Clone, Debug, PartialEq)]
pub struct SentCommand {
    pub session: SessionId,
    pub command: CommandKind,
    pub result: Result<Ack, TransportError>,
}

#[derive(Default)]
struct MemoryState {
    receivers: Vec<ReceiverDescriptor>,
    connect_script: VecDeque<Result<(), ConnectError>>,
    send_script: VecDeque<Result<Ack, TransportError>>,
    connect_delay: Duration,
    send_delay: Duration,
    disconnect_delay: Duration,
    open: HashMap<SessionId, Vec<Sender<ReceiverEvent>>>,
    sent: Vec<SentCommand>,
    closed: Vec<SessionId>,
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor registering a single receiver.
    pub fn with_receiver(id: &str, friendly_name: &str) -> (Self, ReceiverDescriptor) {
        let transport = Self::new();
        let descriptor = ReceiverDescriptor {
            id: ReceiverId(id.to_string()),
            friendly_name: friendly_name.to_string(),
            model_name: Some("memory".to_string()),
            location: format!("memory://{id}"),
        };
        transport.add_receiver(descriptor.clone());
        (transport, descriptor)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_receiver(&self, descriptor: ReceiverDescriptor) {
        self.lock().receivers.push(descriptor);
    }

    /// Queues the outcome of the next `connect` call. Unscripted calls succeed.
    pub fn script_connect(&self, outcome: Result<(), ConnectError>) {
        self.lock().connect_script.push_back(outcome);
    }

    /// Queues the outcome of the next `send` call. Unscripted calls are acknowledged.
    pub fn script_send(&self, outcome: Result<Ack, TransportError>) {
        self.lock().send_script.push_back(outcome);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    pub fn set_send_delay(&self, delay: Duration) {
        self.lock().send_delay = delay;
    }

    pub fn set_disconnect_delay(&self, delay: Duration) {
        self.lock().disconnect_delay = delay;
    }

    /// Every `send` attempt so far, retries included.
    pub fn sent(&self) -> Vec<SentCommand> {
        self.lock().sent.clone()
    }

    /// Names of the commands sent so far, in order.
    pub fn sent_names(&self) -> Vec<&'static str> {
        self.lock().sent.iter().map(|s| s.command.name()).collect()
    }

    /// Sessions currently open.
    pub fn open_sessions(&self) -> Vec<SessionId> {
        self.lock().open.keys().cloned().collect()
    }

    /// Sessions closed through `disconnect` or [`MemoryTransport::close_stream`].
    pub fn closed_sessions(&self) -> Vec<SessionId> {
        self.lock().closed.clone()
    }

    /// Delivers `event` to every subscriber of every open session.
    /// Returns the number of subscribers reached.
    pub fn push(&self, event: ReceiverEvent) -> usize {
        let mut state = self.lock();
        let mut delivered = 0;
        for subscribers in state.open.values_mut() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
            delivered += subscribers.len();
        }
        delivered
    }

    /// Drops the event streams of `session` as if the receiver vanished
    /// without a goodbye.
    pub fn close_stream(&self, session: &SessionId) {
        let mut state = self.lock();
        if state.open.remove(session).is_some() {
            state.closed.push(session.clone());
        }
    }
}

impl TransportAdapter for MemoryTransport {
    fn discover(&self) -> Box<dyn Iterator<Item = ReceiverDescriptor> + Send + '_> {
        let receivers = self.lock().receivers.clone();
        Box::new(receivers.into_iter())
    }

    fn connect(&self, receiver: &ReceiverDescriptor) -> Result<SessionHandle, ConnectError> {
        let delay = self.lock().connect_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut state = self.lock();
        if !state.receivers.iter().any(|r| r.id == receiver.id) {
            return Err(ConnectError::Unavailable);
        }
        state.connect_script.pop_front().unwrap_or(Ok(()))?;

        let handle = SessionHandle {
            id: SessionId(Uuid::new_v4().to_string()),
            receiver: receiver.id.clone(),
        };
        state.open.insert(handle.id.clone(), Vec::new());
        debug!(session = %handle.id, receiver = %receiver.id, "Memory session opened");
        Ok(handle)
    }

    fn disconnect(&self, session: &SessionHandle) {
        let delay = self.lock().disconnect_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.close_stream(&session.id);
    }

    fn send(&self, session: &SessionHandle, command: &CommandKind) -> Result<Ack, TransportError> {
        let delay = self.lock().send_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut state = self.lock();
        let result = if state.open.contains_key(&session.id) {
            state.send_script.pop_front().unwrap_or(Ok(Ack))
        } else {
            Err(TransportError::NotConnected)
        };
        state.sent.push(SentCommand {
            session: session.id.clone(),
            command: command.clone(),
            result,
        });
        result
    }

    fn subscribe(&self, session: &SessionHandle) -> Receiver<ReceiverEvent> {
        let (tx, rx) = unbounded();
        if let Some(subscribers) = self.lock().open.get_mut(&session.id) {
            subscribers.push(tx);
        }
        // Unknown session: tx is dropped and the stream is closed right away.
        rx
    }
}
