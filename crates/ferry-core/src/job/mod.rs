//! Job records, the status state machine, and the registry that owns them.

mod registry;
mod state;
mod types;

pub use registry::{JobRegistry, TransitionFields};
pub use state::can_transition;
pub use types::{Job, JobFilter, JobId, JobRequest, JobSnapshot, JobStatus, Priority};

pub(crate) use types::unix_timestamp;
