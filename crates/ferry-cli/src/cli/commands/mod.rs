//! CLI command handlers, one file per command family.

mod checksum;
mod control;
mod get;
mod history;
mod probe;
mod recover;
mod resumable;

pub use checksum::run_checksum;
pub use control::{run_cancel, run_pause, run_resume, run_status};
pub use get::{run_get, GetArgs};
pub use history::run_history;
pub use probe::run_probe;
pub use recover::run_recover;
pub use resumable::run_resumable;

/// Bytes as MiB with one decimal.
fn mib(bytes: u64) -> f64 {
    bytes as f64 / 1_048_576.0
}

/// First eight characters of a job id.
fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
