mod actor;

pub mod controller;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod model;
pub mod projector;
pub mod session;
pub mod share;
pub mod transport;

pub use actor::SessionSnapshot;
pub use controller::{CastController, ControllerConfig};
pub use dispatcher::CommandTicket;
pub use errors::{CommandError, ConnectError, ControllerError, TransportError};
pub use events::{EndReason, SessionEvent, SessionEventBus};
pub use model::{
    Ack, Command, CommandId, CommandKind, CommandStatus, MediaItem, PlaybackState, PlayerState,
    ReceiverDescriptor, ReceiverEvent, ReceiverId, ReceiverStatus, Session, SessionHandle,
    SessionId, SessionState, StreamType,
};
pub use projector::{MediaStateProjector, PlaybackStateHandle};
pub use session::{SessionInput, SessionStateMachine, Transition};
pub use share::{LoadRequest, ShareInbox};
pub use transport::{MemoryTransport, TransportAdapter};
