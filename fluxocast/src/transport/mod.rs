//! Receiver transport abstraction.
//!
//! A `TransportAdapter` hides the vendor protocol used to find receivers and
//! talk to them. The session layer only sees decoded values: commands go out
//! as [`CommandKind`], everything the receiver says comes back as a
//! [`ReceiverEvent`] on one subscription channel.

pub mod memory;

use crossbeam_channel::Receiver;

use crate::errors::{ConnectError, TransportError};
use crate::model::{Ack, CommandKind, ReceiverDescriptor, ReceiverEvent, SessionHandle};

pub use memory::MemoryTransport;

pub trait TransportAdapter: Send + Sync {
    /// Scans for receivers. Each call starts a new, finite scan.
    fn discover(&self) -> Box<dyn Iterator<Item = ReceiverDescriptor> + Send + '_>;

    /// Opens a session on `receiver`. May block on network I/O.
    fn connect(&self, receiver: &ReceiverDescriptor) -> Result<SessionHandle, ConnectError>;

    /// Closes the session and releases its network resources. Closing an
    /// already closed session is a no-op.
    fn disconnect(&self, session: &SessionHandle);

    /// Sends one command and waits for the receiver acknowledgement.
    fn send(&self, session: &SessionHandle, command: &CommandKind) -> Result<Ack, TransportError>;

    /// Lifecycle and state pushes for `session`. The channel is closed when
    /// the session is disconnected or ends. Must not block.
    fn subscribe(&self, session: &SessionHandle) -> Receiver<ReceiverEvent>;
}
