use std::io;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("timed out waiting for the primary")]
    Timeout,

    #[error("connection closed by the primary")]
    Closed,

    #[error("not connected to the primary")]
    NotConnected,

    #[error("failed to bind '{path}'")]
    Bind {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IpcError {
    /// Folds socket-level failures into the definite outcomes callers act on.
    pub(crate) fn from_transfer(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => IpcError::Timeout,
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => IpcError::Closed,
            _ => IpcError::Io(e),
        }
    }
}
