//! Public entry point.
//!
//! `CastController` is a cheap handle on the session actor: it validates
//! commands, assigns their ids and forwards everything else as messages.
//! State queries read the snapshots the actor publishes and never wait on it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, info, warn};

use crate::actor::{ActorMessage, SessionSnapshot, SessionSnapshotHandle, spawn_session_actor};
use crate::dispatcher::{CommandTicket, PendingCommand};
use crate::errors::{CommandError, ConnectError, ControllerError};
use crate::events::{SessionEvent, SessionEventBus};
use crate::model::{
    CommandId, CommandKind, MediaItem, PlaybackState, ReceiverDescriptor, Session, SessionId,
    SessionState,
};
use crate::projector::PlaybackStateHandle;
use crate::share::LoadRequest;
use crate::transport::TransportAdapter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Upper bound of the Connecting state.
    pub connect_timeout: Duration,
    /// How long a Suspended session may wait for the receiver to come back.
    pub suspend_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            suspend_timeout: Duration::from_secs(30),
        }
    }
}

impl ControllerConfig {
    /// Reads the `cast.session` timeouts.
    pub fn from_config(config: &fluxoconfig::Config) -> anyhow::Result<Self> {
        let settings = config.cast_settings()?;
        Ok(Self {
            connect_timeout: Duration::from_secs(settings.session.connect_timeout_secs.max(1)),
            suspend_timeout: Duration::from_secs(settings.session.suspend_timeout_secs),
        })
    }
}

pub struct CastController {
    transport: Arc<dyn TransportAdapter>,
    inbox: Sender<ActorMessage>,
    bus: SessionEventBus,
    session: SessionSnapshotHandle,
    playback: PlaybackStateHandle,
    next_command_id: AtomicU64,
    connect_requested: AtomicBool,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl CastController {
    pub fn spawn(
        transport: Arc<dyn TransportAdapter>,
        config: ControllerConfig,
    ) -> Result<Self, ControllerError> {
        let bus = SessionEventBus::new();
        let handles = spawn_session_actor(
            Arc::clone(&transport),
            bus.clone(),
            config.connect_timeout,
            config.suspend_timeout,
        )?;

        info!(
            connect_timeout_ms = config.connect_timeout.as_millis() as u64,
            suspend_timeout_ms = config.suspend_timeout.as_millis() as u64,
            "Cast controller started"
        );

        Ok(Self {
            transport,
            inbox: handles.inbox,
            bus,
            session: handles.session,
            playback: handles.playback,
            next_command_id: AtomicU64::new(1),
            connect_requested: AtomicBool::new(false),
            actor: Mutex::new(Some(handles.join)),
        })
    }

    /// Starts a fresh scan for receivers.
    pub fn discover(&self) -> Box<dyn Iterator<Item = ReceiverDescriptor> + Send + '_> {
        self.transport.discover()
    }

    /// Opens a session on `receiver` and waits until the attempt resolves.
    ///
    /// A Connected or Suspended session is torn down first. Fails with
    /// [`ConnectError::Busy`] while another connect or a teardown is running,
    /// and with [`ConnectError::Cancelled`] if `disconnect` is called before
    /// that teardown completes.
    pub fn connect(&self, receiver: &ReceiverDescriptor) -> Result<SessionId, ConnectError> {
        self.connect_requested.store(true, Ordering::SeqCst);

        let (reply, outcome) = bounded(1);
        let message = ActorMessage::Connect {
            receiver: receiver.clone(),
            reply,
        };
        if self.inbox.send(message).is_err() {
            return Err(ConnectError::ControllerStopped);
        }
        outcome
            .recv()
            .unwrap_or(Err(ConnectError::ControllerStopped))
    }

    /// Ends the current session, if any, and waits for the teardown.
    /// Calling it again is a no-op.
    pub fn disconnect(&self) {
        let (reply, done) = bounded(1);
        if self.inbox.send(ActorMessage::Disconnect { reply }).is_err() {
            debug!("Disconnect ignored, controller already stopped");
            return;
        }
        let _ = done.recv();
    }

    /// Queues `kind` without blocking.
    ///
    /// Arguments are validated first. Until `connect` has been called once,
    /// commands are refused with [`CommandError::RejectedNoSession`].
    pub fn enqueue(&self, kind: CommandKind) -> Result<CommandTicket, CommandError> {
        let id = CommandId(self.next_command_id.fetch_add(1, Ordering::Relaxed));
        let (pending, ticket) = PendingCommand::new(id, kind)?;

        if !self.connect_requested.load(Ordering::SeqCst) {
            debug!(command = %id, "Command rejected, no session was requested");
            return Err(CommandError::RejectedNoSession);
        }
        if self.inbox.send(ActorMessage::Enqueue(pending)).is_err() {
            return Err(CommandError::ControllerStopped);
        }
        Ok(ticket)
    }

    pub fn load(&self, item: MediaItem) -> Result<CommandTicket, CommandError> {
        self.enqueue(CommandKind::Load(item))
    }

    /// Loads the media described by a host JSON payload.
    pub fn load_json(&self, payload: &str) -> Result<CommandTicket, CommandError> {
        let item = LoadRequest::from_json(payload)?.into_media_item()?;
        self.load(item)
    }

    pub fn play(&self) -> Result<CommandTicket, CommandError> {
        self.enqueue(CommandKind::Play)
    }

    pub fn pause(&self) -> Result<CommandTicket, CommandError> {
        self.enqueue(CommandKind::Pause)
    }

    pub fn stop(&self) -> Result<CommandTicket, CommandError> {
        self.enqueue(CommandKind::Stop)
    }

    pub fn seek(&self, position_ms: i64) -> Result<CommandTicket, CommandError> {
        self.enqueue(CommandKind::Seek { position_ms })
    }

    pub fn set_volume(&self, level: f64) -> Result<CommandTicket, CommandError> {
        self.enqueue(CommandKind::SetVolume { level })
    }

    pub fn current_playback_state(&self) -> PlaybackState {
        self.playback.snapshot()
    }

    pub fn current_session_state(&self) -> SessionState {
        self.session.snapshot().state
    }

    /// The current session, kept after it ended until the next connect.
    pub fn current_session(&self) -> Option<Session> {
        self.session.snapshot().session
    }

    pub fn session_snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    pub fn subscribe_events(&self) -> Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    /// Ends the session, fails every pending command with
    /// [`CommandError::ControllerStopped`] and joins the actor thread.
    pub fn shutdown(&self) {
        let join = match self.actor.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(join) = join else {
            return;
        };

        let (reply, done) = bounded(1);
        if self.inbox.send(ActorMessage::Shutdown { reply }).is_ok() {
            let _ = done.recv();
        }
        if join.join().is_err() {
            warn!("Session actor panicked");
        }
        info!("Cast controller stopped");
    }
}

impl Drop for CastController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_timeouts() {
        let config = ControllerConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.suspend_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("config.yaml")).unwrap();
        writeln!(
            file,
            "cast:\n  session:\n    suspend_timeout_secs: 5\n    connect_timeout_secs: 2"
        )
        .unwrap();

        let config = fluxoconfig::Config::load_config(dir.path().to_str().unwrap()).unwrap();
        let controller_config = ControllerConfig::from_config(&config).unwrap();
        assert_eq!(controller_config.suspend_timeout, Duration::from_secs(5));
        assert_eq!(controller_config.connect_timeout, Duration::from_secs(2));
    }
}
