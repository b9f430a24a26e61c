//! Legal job status transitions.

use super::types::JobStatus;

/// Whether `from -> to` is a legal move.
///
/// `Pending -> Admitted -> Transferring -> {Completed | Paused | Failed}`,
/// `Paused -> Admitted`, and `Cancelled` from any non-terminal state. Jobs may
/// also be paused before they start transferring.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    if from.is_terminal() {
        return false;
    }
    match (from, to) {
        (_, Cancelled) => true,
        (Pending, Admitted) | (Pending, Paused) => true,
        (Admitted, Transferring) | (Admitted, Paused) => true,
        (Transferring, Completed) | (Transferring, Paused) | (Transferring, Failed) => true,
        (Paused, Admitted) => true,
        _ => false,
    }
}
