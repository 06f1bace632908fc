//! Command queue and dispatcher.
//!
//! Commands leave the queue strictly in submission order, one at a time, and
//! only while the session is Connected. Each submitter holds a
//! [`CommandTicket`] that receives the command exactly once, with its
//! terminal status.

use std::collections::VecDeque;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, warn};

use crate::errors::{CommandError, TransportError};
use crate::model::{Command, CommandId, CommandKind, CommandStatus, SessionState};

/// First attempt plus one retry on transport timeout.
const MAX_ATTEMPTS: u8 = 2;

/// Caller side of an enqueued command.
#[derive(Debug)]
pub struct CommandTicket {
    id: CommandId,
    outcome: Receiver<Command>,
}

impl CommandTicket {
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Non-blocking poll for the terminal outcome.
    pub fn try_outcome(&self) -> Option<Command> {
        self.outcome.try_recv().ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Command> {
        self.outcome.recv_timeout(timeout).ok()
    }
}

/// Dispatcher side of an enqueued command.
#[derive(Debug)]
pub struct PendingCommand {
    command: Command,
    reply: Sender<Command>,
    /// Sends made so far that may have reached the receiver.
    attempts: u8,
}

impl PendingCommand {
    /// Validates `kind` and pairs the command with its ticket.
    pub fn new(id: CommandId, kind: CommandKind) -> Result<(Self, CommandTicket), CommandError> {
        kind.validate()?;
        let (reply, outcome) = bounded(1);
        let pending = Self {
            command: Command::new(id, kind),
            reply,
            attempts: 0,
        };
        Ok((pending, CommandTicket { id, outcome }))
    }

    pub fn id(&self) -> CommandId {
        self.command.id
    }

    pub fn kind(&self) -> &CommandKind {
        &self.command.kind
    }

    /// Reports the terminal status. The submitter may have dropped its ticket.
    pub(crate) fn finish(mut self, status: CommandStatus) {
        self.command.status = status;
        let _ = self.reply.send(self.command);
    }
}

/// A command handed to the transport.
#[derive(Clone, Debug, PartialEq)]
pub struct Dispatch {
    pub id: CommandId,
    pub kind: CommandKind,
    pub attempt: u8,
}

/// What the dispatcher did with a failed send.
#[derive(Debug, PartialEq)]
pub enum SendFailure {
    /// Same command, to be sent again.
    Retry(Dispatch),
    /// Back at the head of the queue; the session should be suspended.
    Requeued,
    /// Reported to the submitter.
    Failed(CommandError),
    /// No such command in flight (stale result).
    Unknown,
}

#[derive(Debug, Default)]
pub struct Dispatcher {
    queue: VecDeque<PendingCommand>,
    held: VecDeque<PendingCommand>,
    in_flight: Option<PendingCommand>,
    has_loaded_media: bool,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pending: PendingCommand) {
        debug!(
            command = %pending.id(),
            kind = pending.kind().name(),
            queue_len = self.queue.len() + 1,
            "Command queued"
        );
        self.queue.push_back(pending);
    }

    pub fn has_loaded_media(&self) -> bool {
        self.has_loaded_media
    }

    /// Kind of the in-flight command, if it is `id`.
    pub fn in_flight_kind(&self, id: CommandId) -> Option<&CommandKind> {
        self.in_flight
            .as_ref()
            .filter(|f| f.id() == id)
            .map(|f| f.kind())
    }

    /// Queued and held commands, in-flight excluded.
    pub fn pending_len(&self) -> usize {
        self.queue.len() + self.held.len()
    }

    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.queue.is_empty() && self.held.is_empty()
    }

    /// Picks the next command to send, if the session allows it.
    ///
    /// Seek and volume commands found at the head while no media is loaded
    /// are parked until a Load is acknowledged.
    pub fn next_dispatch(&mut self, state: SessionState) -> Option<Dispatch> {
        if state != SessionState::Connected || self.in_flight.is_some() {
            return None;
        }

        while let Some(mut pending) = self.queue.pop_front() {
            if pending.kind().requires_loaded_media() && !self.has_loaded_media {
                debug!(
                    command = %pending.id(),
                    kind = pending.kind().name(),
                    "Holding command until media is loaded"
                );
                self.held.push_back(pending);
                continue;
            }

            pending.command.status = CommandStatus::Sent;
            pending.attempts += 1;
            let dispatch = Dispatch {
                id: pending.id(),
                kind: pending.kind().clone(),
                attempt: pending.attempts,
            };
            self.in_flight = Some(pending);
            return Some(dispatch);
        }

        None
    }

    /// Marks the in-flight command acknowledged and returns its kind so the
    /// projector can apply it.
    pub fn on_acknowledged(&mut self, id: CommandId) -> Option<CommandKind> {
        let in_flight = self.take_in_flight(id)?;
        let kind = in_flight.kind().clone();

        if matches!(kind, CommandKind::Load(_)) {
            self.has_loaded_media = true;
            // Held commands go back first, keeping their relative order.
            while let Some(held) = self.held.pop_back() {
                self.queue.push_front(held);
            }
        }

        debug!(command = %id, kind = kind.name(), "Command acknowledged");
        in_flight.finish(CommandStatus::Acknowledged);
        Some(kind)
    }

    /// Puts a command whose retry could not be sent back at the head of the
    /// queue without resolving it. The retry stays owed: the next dispatch is
    /// its last attempt. Returns false if `id` is not in flight.
    pub fn park_in_flight(&mut self, id: CommandId) -> bool {
        let Some(mut pending) = self.take_in_flight(id) else {
            return false;
        };
        pending.attempts = pending.attempts.saturating_sub(1);
        debug!(command = %id, attempts = pending.attempts, "In-flight command parked");
        pending.command.status = CommandStatus::Pending;
        self.queue.push_front(pending);
        true
    }

    pub fn on_send_failed(&mut self, id: CommandId, error: TransportError) -> SendFailure {
        let Some(mut in_flight) = self.take_in_flight(id) else {
            return SendFailure::Unknown;
        };

        match error {
            TransportError::NotConnected => {
                debug!(command = %id, "Transport lost, command requeued");
                // The receiver never saw it.
                in_flight.attempts = in_flight.attempts.saturating_sub(1);
                in_flight.command.status = CommandStatus::Pending;
                self.queue.push_front(in_flight);
                SendFailure::Requeued
            }
            TransportError::Timeout
                if in_flight.kind().retry_on_timeout()
                    && in_flight.attempts < MAX_ATTEMPTS =>
            {
                in_flight.attempts += 1;
                let dispatch = Dispatch {
                    id,
                    kind: in_flight.kind().clone(),
                    attempt: in_flight.attempts,
                };
                debug!(command = %id, attempt = dispatch.attempt, "Retrying command after timeout");
                self.in_flight = Some(in_flight);
                SendFailure::Retry(dispatch)
            }
            other => {
                let reason = CommandError::Transport(other);
                warn!(
                    command = %id,
                    kind = in_flight.kind().name(),
                    error = %other,
                    "Command failed"
                );
                in_flight.finish(CommandStatus::Failed(reason.clone()));
                SendFailure::Failed(reason)
            }
        }
    }

    /// Fails every queued, held and in-flight command with `reason` and
    /// forgets the loaded media. Returns the number of failed commands.
    pub fn fail_all(&mut self, reason: CommandError) -> usize {
        let mut pending: Vec<PendingCommand> = self
            .in_flight
            .take()
            .into_iter()
            .chain(self.held.drain(..))
            .chain(self.queue.drain(..))
            .collect();
        pending.sort_by_key(|p| p.id());

        let count = pending.len();
        for p in pending {
            p.finish(CommandStatus::Failed(reason.clone()));
        }
        self.has_loaded_media = false;

        if count > 0 {
            debug!(count, reason = %reason, "Failed pending commands");
        }
        count
    }

    fn take_in_flight(&mut self, id: CommandId) -> Option<PendingCommand> {
        if self.in_flight.as_ref().is_some_and(|f| f.id() == id) {
            self.in_flight.take()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MediaItem;

    fn pending(id: u64, kind: CommandKind) -> (PendingCommand, CommandTicket) {
        PendingCommand::new(CommandId(id), kind).unwrap()
    }

    fn load() -> CommandKind {
        CommandKind::Load(MediaItem::new("https://cdn.example.com/a.mp4").unwrap())
    }

    /// Dispatches and acknowledges everything, returning the sent order.
    fn drain(d: &mut Dispatcher) -> Vec<&'static str> {
        let mut sent = Vec::new();
        while let Some(dispatch) = d.next_dispatch(SessionState::Connected) {
            sent.push(dispatch.kind.name());
            d.on_acknowledged(dispatch.id).unwrap();
        }
        sent
    }

    #[test]
    fn test_validation_before_queue() {
        assert!(matches!(
            PendingCommand::new(CommandId(1), CommandKind::Seek { position_ms: -1 }),
            Err(CommandError::InvalidArgument(_))
        ));
        assert!(matches!(
            PendingCommand::new(CommandId(2), CommandKind::SetVolume { level: 1.5 }),
            Err(CommandError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_fifo_with_interleaved_kinds() {
        let mut d = Dispatcher::new();
        let kinds = vec![
            load(),
            CommandKind::Play,
            CommandKind::Seek { position_ms: 1_000 },
            CommandKind::Pause,
            CommandKind::SetVolume { level: 0.4 },
            CommandKind::Play,
            CommandKind::Stop,
        ];
        let tickets: Vec<_> = kinds
            .into_iter()
            .enumerate()
            .map(|(i, k)| {
                let (p, t) = pending(i as u64, k);
                d.push(p);
                t
            })
            .collect();

        assert_eq!(
            drain(&mut d),
            vec!["load", "play", "seek", "pause", "set_volume", "play", "stop"]
        );
        for ticket in tickets {
            assert_eq!(ticket.try_outcome().unwrap().status, CommandStatus::Acknowledged);
        }
    }

    #[test]
    fn test_nothing_dispatched_unless_connected() {
        let mut d = Dispatcher::new();
        let (p, _t) = pending(1, CommandKind::Play);
        d.push(p);

        for state in [
            SessionState::Disconnected,
            SessionState::Connecting,
            SessionState::Suspended,
            SessionState::Ending,
            SessionState::Ended,
        ] {
            assert!(d.next_dispatch(state).is_none());
        }
        assert_eq!(d.pending_len(), 1);
        assert!(d.next_dispatch(SessionState::Connected).is_some());
    }

    #[test]
    fn test_one_command_in_flight() {
        let mut d = Dispatcher::new();
        let (p1, _t1) = pending(1, CommandKind::Play);
        let (p2, _t2) = pending(2, CommandKind::Pause);
        d.push(p1);
        d.push(p2);

        let first = d.next_dispatch(SessionState::Connected).unwrap();
        assert!(d.next_dispatch(SessionState::Connected).is_none());
        d.on_acknowledged(first.id);
        assert_eq!(
            d.next_dispatch(SessionState::Connected).unwrap().id,
            CommandId(2)
        );
    }

    #[test]
    fn test_seek_held_until_load_acknowledged() {
        let mut d = Dispatcher::new();
        let (seek, seek_ticket) = pending(1, CommandKind::Seek { position_ms: 5_000 });
        let (vol, _) = pending(2, CommandKind::SetVolume { level: 0.5 });
        let (play, _) = pending(3, CommandKind::Play);
        let (ld, _) = pending(4, load());
        let (pause, _) = pending(5, CommandKind::Pause);
        for p in [seek, vol, play, ld, pause] {
            d.push(p);
        }

        let first = d.next_dispatch(SessionState::Connected).unwrap();
        assert_eq!(first.kind, CommandKind::Play);
        assert_eq!(d.held_len(), 2);
        d.on_acknowledged(first.id);

        let second = d.next_dispatch(SessionState::Connected).unwrap();
        assert!(matches!(second.kind, CommandKind::Load(_)));
        assert!(seek_ticket.try_outcome().is_none());
        d.on_acknowledged(second.id);
        assert!(d.has_loaded_media());
        assert_eq!(d.held_len(), 0);

        assert_eq!(drain(&mut d), vec!["seek", "set_volume", "pause"]);
        assert_eq!(
            seek_ticket.try_outcome().unwrap().status,
            CommandStatus::Acknowledged
        );
    }

    #[test]
    fn test_timeout_retried_once_for_play() {
        let mut d = Dispatcher::new();
        let (p, ticket) = pending(1, CommandKind::Play);
        d.push(p);

        let first = d.next_dispatch(SessionState::Connected).unwrap();
        let retry = match d.on_send_failed(first.id, TransportError::Timeout) {
            SendFailure::Retry(dispatch) => dispatch,
            other => panic!("expected retry, got {other:?}"),
        };
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.kind, CommandKind::Play);
        assert!(ticket.try_outcome().is_none());

        assert_eq!(
            d.on_send_failed(retry.id, TransportError::Timeout),
            SendFailure::Failed(CommandError::Transport(TransportError::Timeout))
        );
        assert_eq!(
            ticket.try_outcome().unwrap().status,
            CommandStatus::Failed(CommandError::Transport(TransportError::Timeout))
        );
        assert!(d.is_idle());
    }

    #[test]
    fn test_parked_retry_is_sent_once_more() {
        let mut d = Dispatcher::new();
        let (p1, ticket) = pending(1, CommandKind::Play);
        let (p2, _t2) = pending(2, CommandKind::Pause);
        d.push(p1);
        d.push(p2);

        let first = d.next_dispatch(SessionState::Connected).unwrap();
        let retry = match d.on_send_failed(first.id, TransportError::Timeout) {
            SendFailure::Retry(dispatch) => dispatch,
            other => panic!("expected retry, got {other:?}"),
        };
        assert!(d.park_in_flight(retry.id));
        assert!(!d.park_in_flight(retry.id));
        assert!(d.next_dispatch(SessionState::Suspended).is_none());
        assert!(ticket.try_outcome().is_none());

        let resent = d.next_dispatch(SessionState::Connected).unwrap();
        assert_eq!(resent.id, CommandId(1));
        assert_eq!(resent.attempt, 2);
        assert!(matches!(
            d.on_send_failed(resent.id, TransportError::Timeout),
            SendFailure::Failed(_)
        ));
        assert_eq!(
            d.next_dispatch(SessionState::Connected).unwrap().id,
            CommandId(2)
        );
    }

    #[test]
    fn test_requeue_does_not_use_up_the_retry() {
        let mut d = Dispatcher::new();
        let (p, _t) = pending(1, CommandKind::Stop);
        d.push(p);

        let first = d.next_dispatch(SessionState::Connected).unwrap();
        d.on_send_failed(first.id, TransportError::NotConnected);
        let again = d.next_dispatch(SessionState::Connected).unwrap();
        assert_eq!(again.attempt, 1);
        assert!(matches!(
            d.on_send_failed(again.id, TransportError::Timeout),
            SendFailure::Retry(_)
        ));
    }

    #[test]
    fn test_load_never_retried() {
        let mut d = Dispatcher::new();
        let (p, ticket) = pending(1, load());
        d.push(p);

        let first = d.next_dispatch(SessionState::Connected).unwrap();
        assert!(matches!(
            d.on_send_failed(first.id, TransportError::Timeout),
            SendFailure::Failed(_)
        ));
        assert!(matches!(
            ticket.try_outcome().unwrap().status,
            CommandStatus::Failed(CommandError::Transport(TransportError::Timeout))
        ));
        assert!(!d.has_loaded_media());
    }

    #[test]
    fn test_not_connected_requeues_at_head() {
        let mut d = Dispatcher::new();
        let (p1, t1) = pending(1, CommandKind::Play);
        let (p2, _t2) = pending(2, CommandKind::Pause);
        d.push(p1);
        d.push(p2);

        let first = d.next_dispatch(SessionState::Connected).unwrap();
        assert_eq!(
            d.on_send_failed(first.id, TransportError::NotConnected),
            SendFailure::Requeued
        );
        assert!(t1.try_outcome().is_none());
        assert_eq!(d.pending_len(), 2);

        assert_eq!(
            d.next_dispatch(SessionState::Connected).unwrap().id,
            CommandId(1)
        );
    }

    #[test]
    fn test_receiver_busy_surfaces() {
        let mut d = Dispatcher::new();
        let (p, t) = pending(1, CommandKind::Pause);
        d.push(p);
        let first = d.next_dispatch(SessionState::Connected).unwrap();
        d.on_send_failed(first.id, TransportError::ReceiverBusy);
        assert_eq!(
            t.try_outcome().unwrap().status,
            CommandStatus::Failed(CommandError::Transport(TransportError::ReceiverBusy))
        );
    }

    #[test]
    fn test_fail_all_reports_every_command() {
        let mut d = Dispatcher::new();
        let (ld, t_load) = pending(1, load());
        d.push(ld);
        let dispatch = d.next_dispatch(SessionState::Connected).unwrap();
        d.on_acknowledged(dispatch.id);

        let (play, t_play) = pending(2, CommandKind::Play);
        let (seek, t_seek) = pending(3, CommandKind::Seek { position_ms: 10 });
        d.push(play);
        d.push(seek);
        d.next_dispatch(SessionState::Connected).unwrap();

        assert_eq!(d.fail_all(CommandError::SessionEnded), 2);
        assert!(d.is_idle());
        assert!(!d.has_loaded_media());
        assert_eq!(t_load.try_outcome().unwrap().status, CommandStatus::Acknowledged);
        for t in [t_play, t_seek] {
            assert_eq!(
                t.try_outcome().unwrap().status,
                CommandStatus::Failed(CommandError::SessionEnded)
            );
        }
    }

    #[test]
    fn test_stale_results_are_ignored() {
        let mut d = Dispatcher::new();
        assert_eq!(d.on_acknowledged(CommandId(9)), None);
        assert_eq!(
            d.on_send_failed(CommandId(9), TransportError::Timeout),
            SendFailure::Unknown
        );
    }
}
