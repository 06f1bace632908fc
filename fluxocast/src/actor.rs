//! Session actor.
//!
//! One thread owns the [`SessionStateMachine`], the [`Dispatcher`] and the
//! [`MediaStateProjector`]. Everything else talks to it through
//! [`ActorMessage`]s: the public controller, the receiver event stream of the
//! current session and two worker threads that run the blocking transport
//! calls (`connect`/`disconnect` on one, `send` on the other) and post their
//! results back. Deadlines of the Connecting and Suspended states are enforced
//! by the actor's own select timer.

use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, at, never, select, unbounded};
use tracing::{debug, error, info, trace, warn};

use crate::dispatcher::{Dispatch, Dispatcher, PendingCommand, SendFailure};
use crate::errors::{CommandError, ConnectError, ControllerError, TransportError};
use crate::events::{EndReason, SessionEvent, SessionEventBus};
use crate::model::{
    Ack, CommandId, ReceiverDescriptor, ReceiverEvent, Session, SessionHandle, SessionId,
    SessionState,
};
use crate::projector::{MediaStateProjector, PlaybackStateHandle};
use crate::session::{DeadlineKind, SessionInput, SessionStateMachine};
use crate::transport::TransportAdapter;

pub(crate) type ConnectReply = Sender<Result<SessionId, ConnectError>>;

pub(crate) enum ActorMessage {
    Connect {
        receiver: ReceiverDescriptor,
        reply: ConnectReply,
    },
    Disconnect {
        reply: Sender<()>,
    },
    Enqueue(PendingCommand),
    ConnectFinished {
        attempt: u64,
        result: Result<SessionHandle, ConnectError>,
    },
    SendFinished {
        session: SessionId,
        id: CommandId,
        result: Result<Ack, TransportError>,
    },
    DisconnectFinished {
        session: SessionId,
    },
    Shutdown {
        reply: Sender<()>,
    },
}

/// Consistent view of the session, published by the actor after every
/// transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub session: Option<Session>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            session: None,
        }
    }
}

/// Shared read side of the actor state.
#[derive(Clone, Debug, Default)]
pub(crate) struct SessionSnapshotHandle {
    inner: Arc<RwLock<SessionSnapshot>>,
}

impl SessionSnapshotHandle {
    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        match self.inner.read() {
            Ok(snapshot) => snapshot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionSnapshot> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) struct ActorHandles {
    pub inbox: Sender<ActorMessage>,
    pub session: SessionSnapshotHandle,
    pub playback: PlaybackStateHandle,
    pub join: JoinHandle<()>,
}

/// Starts the actor and its two transport workers.
pub(crate) fn spawn_session_actor(
    transport: Arc<dyn TransportAdapter>,
    bus: SessionEventBus,
    connect_timeout: Duration,
    suspend_timeout: Duration,
) -> Result<ActorHandles, ControllerError> {
    let (inbox_tx, inbox_rx) = unbounded::<ActorMessage>();
    let (send_tx, send_rx) = unbounded::<SendJob>();
    let (session_tx, session_rx) = unbounded::<SessionJob>();

    {
        let transport = Arc::clone(&transport);
        let inbox = inbox_tx.clone();
        thread::Builder::new()
            .name("cast-send-worker".into())
            .spawn(move || run_send_worker(transport, send_rx, inbox))
            .map_err(|err| ControllerError::ThreadSpawn("cast-send-worker", err))?;
    }
    {
        let transport = Arc::clone(&transport);
        let inbox = inbox_tx.clone();
        thread::Builder::new()
            .name("cast-session-worker".into())
            .spawn(move || run_session_worker(transport, session_rx, inbox))
            .map_err(|err| ControllerError::ThreadSpawn("cast-session-worker", err))?;
    }

    let projector = MediaStateProjector::new();
    let playback = projector.handle();
    let session = SessionSnapshotHandle::default();

    let actor = SessionActor {
        transport,
        machine: SessionStateMachine::new(connect_timeout, suspend_timeout),
        dispatcher: Dispatcher::new(),
        projector,
        bus,
        published: session.clone(),
        inbox: inbox_rx,
        send_jobs: send_tx,
        session_jobs: session_tx,
        handle: None,
        events: None,
        connect_attempt: 0,
        connect_reply: None,
        pending_connect: None,
        disconnect_deferred: false,
        disconnect_waiters: Vec::new(),
        end_reason: None,
    };

    let join = thread::Builder::new()
        .name("cast-session-actor".into())
        .spawn(move || actor.run())
        .map_err(|err| ControllerError::ThreadSpawn("cast-session-actor", err))?;

    Ok(ActorHandles {
        inbox: inbox_tx,
        session,
        playback,
        join,
    })
}

struct SendJob {
    session: SessionHandle,
    dispatch: Dispatch,
}

enum SessionJob {
    Connect {
        attempt: u64,
        receiver: ReceiverDescriptor,
    },
    Disconnect(SessionHandle),
}

fn run_send_worker(
    transport: Arc<dyn TransportAdapter>,
    jobs: Receiver<SendJob>,
    inbox: Sender<ActorMessage>,
) {
    for job in jobs.iter() {
        trace!(
            session = %job.session.id,
            command = %job.dispatch.id,
            kind = job.dispatch.kind.name(),
            attempt = job.dispatch.attempt,
            "Sending command"
        );
        let result = transport.send(&job.session, &job.dispatch.kind);
        let message = ActorMessage::SendFinished {
            session: job.session.id,
            id: job.dispatch.id,
            result,
        };
        if inbox.send(message).is_err() {
            break;
        }
    }
    debug!("Send worker exiting");
}

fn run_session_worker(
    transport: Arc<dyn TransportAdapter>,
    jobs: Receiver<SessionJob>,
    inbox: Sender<ActorMessage>,
) {
    for job in jobs.iter() {
        match job {
            SessionJob::Connect { attempt, receiver } => {
                let result = transport.connect(&receiver);
                if let Err(returned) = inbox.send(ActorMessage::ConnectFinished { attempt, result })
                {
                    // Nobody is left to own the session.
                    if let ActorMessage::ConnectFinished {
                        result: Ok(handle), ..
                    } = returned.into_inner()
                    {
                        transport.disconnect(&handle);
                    }
                    break;
                }
            }
            SessionJob::Disconnect(handle) => {
                transport.disconnect(&handle);
                let message = ActorMessage::DisconnectFinished { session: handle.id };
                if inbox.send(message).is_err() {
                    break;
                }
            }
        }
    }
    debug!("Session worker exiting");
}

struct SessionActor {
    transport: Arc<dyn TransportAdapter>,
    machine: SessionStateMachine,
    dispatcher: Dispatcher,
    projector: MediaStateProjector,
    bus: SessionEventBus,
    published: SessionSnapshotHandle,
    inbox: Receiver<ActorMessage>,
    send_jobs: Sender<SendJob>,
    session_jobs: Sender<SessionJob>,
    /// Adapter handle of the current session, from Connected until Ended.
    handle: Option<SessionHandle>,
    events: Option<Receiver<ReceiverEvent>>,
    connect_attempt: u64,
    connect_reply: Option<ConnectReply>,
    /// Connect waiting for the superseded session to end.
    pending_connect: Option<(ReceiverDescriptor, ConnectReply)>,
    disconnect_deferred: bool,
    disconnect_waiters: Vec<Sender<()>>,
    end_reason: Option<EndReason>,
}

impl SessionActor {
    fn run(mut self) {
        info!("Session actor started");
        let inbox = self.inbox.clone();

        loop {
            let events = self.events.clone().unwrap_or_else(never);
            let timer = match self.machine.deadline() {
                Some(deadline) => at(deadline),
                None => never(),
            };

            let keep_running = select! {
                recv(inbox) -> message => match message {
                    Ok(message) => self.handle_message(message),
                    Err(_) => {
                        self.shutdown();
                        false
                    }
                },
                recv(events) -> event => {
                    match event {
                        Ok(event) => self.on_receiver_event(event),
                        Err(_) => self.on_event_stream_closed(),
                    }
                    true
                },
                recv(timer) -> _ => {
                    self.on_deadline(Instant::now());
                    true
                },
            };
            if !keep_running {
                break;
            }
        }

        info!("Session actor stopped");
    }

    /// Returns false once the actor must stop.
    fn handle_message(&mut self, message: ActorMessage) -> bool {
        match message {
            ActorMessage::Connect { receiver, reply } => self.on_connect(receiver, reply),
            ActorMessage::Disconnect { reply } => self.on_disconnect(reply),
            ActorMessage::Enqueue(pending) => {
                self.dispatcher.push(pending);
                self.pump();
            }
            ActorMessage::ConnectFinished { attempt, result } => {
                self.on_connect_finished(attempt, result)
            }
            ActorMessage::SendFinished {
                session,
                id,
                result,
            } => self.on_send_finished(session, id, result),
            ActorMessage::DisconnectFinished { session } => self.on_disconnect_finished(session),
            ActorMessage::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    /// Applies `input`, logs the outcome and republishes the snapshot.
    fn transition(&mut self, input: SessionInput) -> bool {
        let name = input.name();
        match self.machine.apply(input, Instant::now()) {
            Ok(transition) => {
                info!(
                    transition = %transition,
                    input = name,
                    session = ?self.machine.session().map(|s| s.id.0.as_str()),
                    "Session transition"
                );
                self.publish();
                true
            }
            Err(err) => {
                warn!(error = %err, "Rejected session transition");
                false
            }
        }
    }

    fn publish(&self) {
        let mut snapshot = self.published.write();
        snapshot.state = self.machine.state();
        snapshot.session = self.machine.session().cloned();
    }

    fn current_session_id(&self) -> Option<SessionId> {
        self.machine.session().map(|s| s.id.clone())
    }

    fn on_connect(&mut self, receiver: ReceiverDescriptor, reply: ConnectReply) {
        match self.machine.state() {
            SessionState::Disconnected | SessionState::Ended => self.start_connect(receiver, reply),
            SessionState::Connected | SessionState::Suspended => {
                info!(receiver = %receiver.id, "Superseding current session");
                self.pending_connect = Some((receiver, reply));
                self.begin_ending(EndReason::Superseded);
            }
            SessionState::Connecting | SessionState::Ending => {
                debug!(
                    receiver = %receiver.id,
                    state = %self.machine.state(),
                    "Connect refused while a transition is in progress"
                );
                let _ = reply.send(Err(ConnectError::Busy));
            }
        }
    }

    fn start_connect(&mut self, receiver: ReceiverDescriptor, reply: ConnectReply) {
        let input = SessionInput::ConnectRequested {
            receiver: receiver.id.clone(),
        };
        if !self.transition(input) {
            let _ = reply.send(Err(ConnectError::Busy));
            return;
        }

        self.connect_attempt += 1;
        self.connect_reply = Some(reply);
        let job = SessionJob::Connect {
            attempt: self.connect_attempt,
            receiver,
        };
        if self.session_jobs.send(job).is_err() {
            error!("Session worker is gone, cannot connect");
            self.fail_connect(ConnectError::ControllerStopped);
        }
    }

    fn on_connect_finished(&mut self, attempt: u64, result: Result<SessionHandle, ConnectError>) {
        if attempt != self.connect_attempt || self.machine.state() != SessionState::Connecting {
            debug!(attempt, "Discarding result of an abandoned connect attempt");
            if let Ok(handle) = result {
                let _ = self.session_jobs.send(SessionJob::Disconnect(handle));
            }
            return;
        }

        match result {
            Ok(handle) => {
                let events = self.transport.subscribe(&handle);
                if !self.transition(SessionInput::ConnectSucceeded(handle.clone())) {
                    let _ = self.session_jobs.send(SessionJob::Disconnect(handle));
                    return;
                }
                self.events = Some(events);
                self.end_reason = None;

                info!(session = %handle.id, receiver = %handle.receiver, "Session started");
                self.bus.broadcast(SessionEvent::Started {
                    session: handle.id.clone(),
                    receiver: handle.receiver.clone(),
                });
                if let Some(reply) = self.connect_reply.take() {
                    let _ = reply.send(Ok(handle.id.clone()));
                }
                self.handle = Some(handle);

                if self.disconnect_deferred {
                    self.disconnect_deferred = false;
                    self.begin_ending(EndReason::Requested);
                } else {
                    self.pump();
                }
            }
            Err(err) => self.fail_connect(err),
        }
    }

    fn fail_connect(&mut self, err: ConnectError) {
        let receiver = self.machine.target().cloned();
        self.transition(SessionInput::ConnectFailed);
        warn!(receiver = ?receiver.as_ref().map(|r| r.0.as_str()), error = %err, "Connect failed");

        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(err));
        }
        if let Some(receiver) = receiver {
            self.bus
                .broadcast(SessionEvent::StartFailed { receiver, error: err });
        }
        self.dispatcher.fail_all(CommandError::ConnectFailed(err));

        if self.disconnect_deferred {
            self.disconnect_deferred = false;
            self.release_disconnect_waiters();
        }
    }

    fn on_disconnect(&mut self, reply: Sender<()>) {
        match self.machine.state() {
            SessionState::Connected | SessionState::Suspended => {
                self.disconnect_waiters.push(reply);
                self.begin_ending(EndReason::Requested);
            }
            SessionState::Connecting => {
                debug!("Disconnect deferred until the connect attempt resolves");
                self.disconnect_deferred = true;
                self.disconnect_waiters.push(reply);
            }
            SessionState::Ending => {
                // The latest request wins over a connect waiting on this teardown.
                if let Some((receiver, pending)) = self.pending_connect.take() {
                    info!(receiver = %receiver.id, "Queued connect cancelled by disconnect");
                    let _ = pending.send(Err(ConnectError::Cancelled));
                }
                self.disconnect_waiters.push(reply);
            }
            SessionState::Disconnected | SessionState::Ended => {
                self.dispatcher.fail_all(CommandError::SessionEnded);
                let _ = reply.send(());
            }
        }
    }

    /// Leaves Connected or Suspended. Pending commands belong to the ending
    /// session and fail now; the adapter is closed on the session worker.
    fn begin_ending(&mut self, reason: EndReason) {
        let input = match reason {
            EndReason::ReceiverTerminated(_) => SessionInput::ReceiverTerminated,
            _ => SessionInput::DisconnectRequested,
        };
        if !self.transition(input) {
            return;
        }

        debug!(reason = %reason, "Ending session");
        self.end_reason = Some(reason);
        self.events = None;
        self.dispatcher.fail_all(CommandError::SessionEnded);

        match self.handle.clone() {
            Some(handle) => {
                if self.session_jobs.send(SessionJob::Disconnect(handle)).is_err() {
                    error!("Session worker is gone, completing teardown locally");
                    self.complete_ending();
                }
            }
            None => self.complete_ending(),
        }
    }

    fn on_disconnect_finished(&mut self, session: SessionId) {
        let current = self.handle.as_ref().map(|h| &h.id);
        if self.machine.state() != SessionState::Ending || current != Some(&session) {
            trace!(session = %session, "Disconnect of a previous session completed");
            return;
        }
        self.complete_ending();
    }

    fn complete_ending(&mut self) {
        if self.transition(SessionInput::EndingComplete) {
            let reason = self.end_reason.take().unwrap_or(EndReason::Requested);
            self.on_ended(reason);
        }
    }

    /// Entered Ended: exactly one `Ended` event per session.
    fn on_ended(&mut self, reason: EndReason) {
        self.handle = None;
        self.events = None;
        self.projector.reset();

        if let Some(session) = self.current_session_id() {
            info!(session = %session, reason = %reason, "Session ended");
            self.bus.broadcast(SessionEvent::Ended { session, reason });
        }
        self.release_disconnect_waiters();

        if let Some((receiver, reply)) = self.pending_connect.take() {
            self.start_connect(receiver, reply);
        }
    }

    fn release_disconnect_waiters(&mut self) {
        for waiter in self.disconnect_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn on_receiver_event(&mut self, event: ReceiverEvent) {
        trace!(event = ?event, "Receiver event");
        match event {
            ReceiverEvent::Suspended { reason } => {
                if self.machine.state() == SessionState::Connected {
                    self.suspend(reason);
                }
            }
            ReceiverEvent::Resumed => {
                if self.machine.state() == SessionState::Suspended
                    && self.transition(SessionInput::Resumed)
                {
                    if let Some(session) = self.current_session_id() {
                        info!(session = %session, "Session resumed");
                        self.bus.broadcast(SessionEvent::Resumed { session });
                    }
                    self.pump();
                }
            }
            ReceiverEvent::Terminated { reason } => {
                if self.machine.state().is_active() {
                    self.begin_ending(EndReason::ReceiverTerminated(reason));
                }
            }
            other => {
                self.machine.touch();
                if self.projector.apply_receiver(&other) {
                    self.publish();
                }
            }
        }
    }

    fn on_event_stream_closed(&mut self) {
        self.events = None;
        if self.machine.state().is_active() {
            warn!("Receiver event stream closed");
            self.begin_ending(EndReason::ReceiverTerminated(
                "event stream closed".to_string(),
            ));
        }
    }

    fn suspend(&mut self, reason: String) {
        if !self.transition(SessionInput::TransientLoss) {
            return;
        }
        if let Some(session) = self.current_session_id() {
            info!(session = %session, reason = reason.as_str(), "Session suspended");
            self.bus
                .broadcast(SessionEvent::Suspended { session, reason });
        }
    }

    fn on_deadline(&mut self, now: Instant) {
        match self.machine.expired(now) {
            Some(DeadlineKind::Connect) => self.fail_connect(ConnectError::Timeout),
            Some(DeadlineKind::Suspend) => {
                if self.transition(SessionInput::SuspendTimeout) {
                    self.dispatcher.fail_all(CommandError::SessionEnded);
                    if let Some(handle) = self.handle.clone() {
                        let _ = self.session_jobs.send(SessionJob::Disconnect(handle));
                    }
                    self.on_ended(EndReason::SuspendTimeout);
                }
            }
            None => {}
        }
    }

    fn on_send_finished(
        &mut self,
        session: SessionId,
        id: CommandId,
        result: Result<Ack, TransportError>,
    ) {
        let current = self.handle.as_ref().map(|h| &h.id);
        if current != Some(&session) {
            debug!(session = %session, command = %id, "Discarding result from a previous session");
            return;
        }

        match result {
            Ok(Ack) => match self.dispatcher.in_flight_kind(id) {
                // Projected before the submitter hears about it.
                Some(kind) => {
                    self.projector.apply_ack(kind);
                    self.dispatcher.on_acknowledged(id);
                    self.machine.touch();
                    self.publish();
                }
                None => debug!(command = %id, "Discarding stale acknowledgement"),
            },
            Err(err) => match self.dispatcher.on_send_failed(id, err) {
                SendFailure::Retry(dispatch) => {
                    if self.machine.state() == SessionState::Connected {
                        self.submit(dispatch);
                        return;
                    }
                    debug!(
                        command = %id,
                        state = %self.machine.state(),
                        "Retry deferred until the session is Connected"
                    );
                    self.dispatcher.park_in_flight(id);
                }
                SendFailure::Requeued => {
                    if self.machine.state() == SessionState::Connected {
                        self.suspend(err.to_string());
                    }
                }
                SendFailure::Failed(_) => {}
                SendFailure::Unknown => {
                    debug!(command = %id, error = %err, "Discarding stale send failure");
                }
            },
        }

        self.pump();
    }

    /// Hands the next command to the send worker, if any may go.
    fn pump(&mut self) {
        if let Some(dispatch) = self.dispatcher.next_dispatch(self.machine.state()) {
            self.submit(dispatch);
        }
    }

    fn submit(&mut self, dispatch: Dispatch) {
        let Some(session) = self.handle.clone() else {
            return;
        };
        if self.send_jobs.send(SendJob { session, dispatch }).is_err() {
            error!("Send worker is gone, failing pending commands");
            self.dispatcher.fail_all(CommandError::ControllerStopped);
        }
    }

    /// Tears everything down synchronously; no worker results are awaited.
    fn shutdown(&mut self) {
        info!(state = %self.machine.state(), "Shutting down session actor");
        if let Some((_, reply)) = self.pending_connect.take() {
            let _ = reply.send(Err(ConnectError::ControllerStopped));
        }
        self.dispatcher.fail_all(CommandError::ControllerStopped);

        match self.machine.state() {
            SessionState::Connecting => {
                self.disconnect_deferred = false;
                self.fail_connect(ConnectError::ControllerStopped);
            }
            SessionState::Connected | SessionState::Suspended => {
                if self.transition(SessionInput::DisconnectRequested) {
                    self.end_reason = Some(EndReason::Shutdown);
                }
            }
            _ => {}
        }

        if self.machine.state() == SessionState::Ending {
            if let Some(handle) = self.handle.clone() {
                self.transport.disconnect(&handle);
            }
            self.complete_ending();
        }

        self.release_disconnect_waiters();
        self.events = None;
    }
}
