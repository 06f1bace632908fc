use thiserror::Error;

/// Failure of a connect attempt. Terminal for that attempt only.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    #[error("receiver is unavailable")]
    Unavailable,
    #[error("receiver rejected the session")]
    Rejected,
    #[error("connect attempt timed out")]
    Timeout,
    #[error("another session transition is in progress")]
    Busy,
    #[error("connect was cancelled by a disconnect")]
    Cancelled,
    #[error("cast controller has been shut down")]
    ControllerStopped,
}

/// Failure reported by a transport adapter while a session is open.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("receiver did not answer in time")]
    Timeout,
    #[error("receiver is busy")]
    ReceiverBusy,
}

/// Terminal failure of a single playback command.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no session was ever requested")]
    RejectedNoSession,
    #[error("session ended before the command completed")]
    SessionEnded,
    #[error("transport failure: {0}")]
    Transport(TransportError),
    #[error("session could not be established: {0}")]
    ConnectFailed(ConnectError),
    #[error("cast controller has been shut down")]
    ControllerStopped,
}

impl CommandError {
    pub fn invalid_argument(message: &str) -> Self {
        CommandError::InvalidArgument(message.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Cannot start {0} thread: {1}")]
    ThreadSpawn(&'static str, std::io::Error),
}
