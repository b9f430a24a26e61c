//! Transfer error taxonomy, raised by transports and classified by the supervisor.

use std::io;

/// Failure of a single transfer attempt.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Unreachable host, connection reset, body cut short.
    #[error("network error: {0}")]
    Network(String),
    /// Connect timeout, stalled read, or the client's overall deadline.
    #[error("timed out: {0}")]
    Timeout(String),
    /// Server answered with a status we cannot use.
    #[error("HTTP {status}")]
    Protocol { status: u16 },
    /// Local write failed (disk full, permission denied). Never retried.
    #[error("storage error: {0}")]
    Storage(#[source] io::Error),
    /// The transport cannot run here (client init, unsupported protocol).
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    /// Stopped by pause or cancel.
    #[error("transfer aborted")]
    Aborted,
}

impl TransferError {
    pub fn network(msg: impl std::fmt::Display) -> Self {
        TransferError::Network(msg.to_string())
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, TransferError::Aborted)
    }
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        TransferError::Storage(e)
    }
}
