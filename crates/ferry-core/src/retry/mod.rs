//! Retry and backoff policy, plus the supervisor that drives a job's attempts.
//!
//! This module encapsulates error classification (timeouts, throttling,
//! connection failures, unavailable transports) and exponential backoff
//! decisions, and owns the ordered transport-strategy fallback loop.

mod classify;
mod error;
mod policy;
mod supervisor;

pub use classify::{classify, classify_http_status, classify_reqwest_error};
pub use error::TransferError;
pub use policy::{ErrorKind, RetryDecision, RetryPolicy};
pub use supervisor::{RetrySupervisor, SupervisorOutcome};
