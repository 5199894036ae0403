use std::time::Duration;
use thiserror::Error;

/// Terminal error of a transfer. Cloneable so the same stored error can be
/// handed to every caller awaiting the transfer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Unable to find file with id {0}")]
    NotFound(String),
    #[error("Connection closed unexpectedly.")]
    ChannelClosed,
    /// Error text sent by the remote peer
    #[error("{0}")]
    RemoteRefusal(String),
    #[error("no data received for {0:?}")]
    Timeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("transfer already started")]
    AlreadyStarted,
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted => TransferError::ChannelClosed,
            ErrorKind::InvalidData => TransferError::Protocol(e.to_string()),
            _ => TransferError::Io(e.to_string()),
        }
    }
}

pub type TransferResult<T> = std::result::Result<T, TransferError>;
