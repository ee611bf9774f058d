//! Server and protocol error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] zangetsu_storage::Error),

    #[error("invalid JSON frame: {0}")]
    InvalidJson(String),

    #[error("stream truncated inside a frame")]
    Truncated,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("unexpected frame type")]
    UnexpectedFrame,

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("peer error: {0}")]
    PeerError(String),

    #[error("peer is not a master (master is {host}:{port})")]
    NotMaster { host: String, port: u16 },

    #[error("replication invariant violated: {0}")]
    QueueInvariant(String),
}

impl Error {
    /// True for the errors an ordinary disconnect produces.
    pub fn is_clean_close(&self) -> bool {
        match self {
            Error::ConnectionClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
