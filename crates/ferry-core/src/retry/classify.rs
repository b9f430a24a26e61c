//! Classify HTTP status and transport errors into retry policy error kinds.

use crate::retry::error::TransferError;
use crate::retry::policy::ErrorKind;

/// Classify an HTTP status code for retry decisions.
pub fn classify_http_status(code: u16) -> ErrorKind {
    match code {
        429 | 503 => ErrorKind::Throttled,
        408 => ErrorKind::Timeout,
        500..=599 => ErrorKind::Http5xx(code),
        _ => ErrorKind::Other,
    }
}

/// Map a reqwest failure onto the transfer taxonomy.
pub fn classify_reqwest_error(e: &reqwest::Error) -> TransferError {
    if e.is_builder() {
        return TransferError::Unavailable(e.to_string());
    }
    if let Some(status) = e.status() {
        return TransferError::Protocol {
            status: status.as_u16(),
        };
    }
    if e.is_timeout() {
        return TransferError::Timeout(e.to_string());
    }
    TransferError::Network(e.to_string())
}

/// Classify a transfer error into an ErrorKind.
pub fn classify(e: &TransferError) -> ErrorKind {
    match e {
        TransferError::Timeout(_) => ErrorKind::Timeout,
        TransferError::Network(_) => ErrorKind::Connection,
        TransferError::Protocol { status } => classify_http_status(*status),
        TransferError::Unavailable(_) => ErrorKind::Unavailable,
        TransferError::Storage(_) | TransferError::Aborted => ErrorKind::Other,
    }
}
