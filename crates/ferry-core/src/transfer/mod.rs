//! Transfer client: one attempt at fetching a URL into its part file.
//!
//! Transports stream the body to disk, resuming at `resume_from` with a
//! `Range` request when possible. They classify failures but never retry;
//! that is the supervisor's job.

mod curl;
mod headers;
mod http;
mod progress;
mod resolve;
mod throttle;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::bandwidth::BandwidthGovernor;
use crate::checkpoint::CheckpointWriter;
use crate::config::{FerryConfig, TransportKind};
use crate::control::AbortHandle;
use crate::job::JobId;
use crate::retry::TransferError;

pub use self::curl::CurlTransport;
pub use self::http::HttpTransport;
pub use headers::{ContentRange, ResponseMeta};
pub use progress::ProgressSink;
pub use resolve::ShareLinkResolver;
pub use throttle::{delay_for, Throttle};

const USER_AGENT: &str = concat!("ferry/", env!("CARGO_PKG_VERSION"));

/// Knobs shared by every attempt.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub chunk_size: usize,
    /// No body bytes for this long fails the attempt.
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            read_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl TransferSettings {
    pub fn from_config(cfg: &FerryConfig) -> Self {
        Self {
            chunk_size: cfg.chunk_size.max(1024),
            read_timeout: cfg.read_timeout(),
            connect_timeout: cfg.connect_timeout(),
        }
    }
}

/// What to fetch and where.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub job_id: JobId,
    pub url: String,
    pub owner: String,
    pub part_path: PathBuf,
    /// Confirmed bytes already in the part file; 0 for a fresh start.
    pub resume_from: u64,
    /// Validator for `If-Range` on resumed requests.
    pub if_range: Option<String>,
}

/// Collaborators for one attempt. Clones share state.
#[derive(Clone)]
pub struct AttemptEnv {
    pub abort: AbortHandle,
    pub progress: ProgressSink,
    pub governor: Arc<BandwidthGovernor>,
    pub checkpoints: CheckpointWriter,
    pub settings: TransferSettings,
}

/// A finished attempt: the part file holds `bytes_written` bytes.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub bytes_written: u64,
    /// Resource size as advertised; equals `bytes_written` when unknown.
    pub bytes_total: u64,
    pub meta: ResponseMeta,
}

/// One transport strategy in the fallback list.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(
        &self,
        req: &TransferRequest,
        env: &AttemptEnv,
    ) -> Result<TransferOutcome, TransferError>;
}

/// Build the configured strategies in order.
pub fn build_transports(kinds: &[TransportKind], settings: &TransferSettings) -> Vec<Arc<dyn Transport>> {
    kinds
        .iter()
        .map(|kind| -> Arc<dyn Transport> {
            match kind {
                TransportKind::Http => Arc::new(HttpTransport::new(settings)),
                TransportKind::Curl => Arc::new(CurlTransport::new()),
            }
        })
        .collect()
}

/// How to treat a response to a request made at `offset`.
#[derive(Debug)]
pub(crate) enum ResponsePlan {
    /// Write the body from `start`; `restarted` when the requested offset was
    /// not honored and the file begins again at zero.
    Write {
        start: u64,
        total: u64,
        resumable: bool,
        restarted: bool,
    },
    /// The part file already holds the whole resource.
    AlreadyComplete { total: u64 },
    /// The offset is past the end of a changed resource; ask again without a range.
    RetryWithoutRange,
    Fail(TransferError),
}

pub(crate) fn plan_response(status: u16, meta: &ResponseMeta, offset: u64) -> ResponsePlan {
    if status == 416 && offset > 0 {
        return match meta.unsatisfied_total {
            Some(total) if total == offset => ResponsePlan::AlreadyComplete { total },
            _ => ResponsePlan::RetryWithoutRange,
        };
    }
    if !(200..300).contains(&status) {
        return ResponsePlan::Fail(TransferError::Protocol { status });
    }
    if status == 206 {
        let start = meta.content_range.map(|cr| cr.start).unwrap_or(0);
        if start != offset && start != 0 {
            return ResponsePlan::Fail(TransferError::network(format!(
                "server sent range starting at {start}, asked for {offset}"
            )));
        }
        return ResponsePlan::Write {
            start,
            total: meta.resource_size(true),
            resumable: true,
            restarted: offset > 0 && start == 0,
        };
    }
    ResponsePlan::Write {
        start: 0,
        total: meta.resource_size(false),
        resumable: meta.accept_ranges,
        restarted: offset > 0,
    }
}

/// A body that ended early is a network failure, not success.
pub(crate) fn check_complete(written: u64, total: u64) -> Result<(), TransferError> {
    if total > 0 && written < total {
        return Err(TransferError::network(format!(
            "connection closed after {written} of {total} bytes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(start: u64, end: u64, total: u64) -> ResponseMeta {
        ResponseMeta {
            content_range: Some(ContentRange {
                start,
                end,
                total: Some(total),
            }),
            ..ResponseMeta::default()
        }
    }

    #[test]
    fn honored_range_resumes() {
        assert!(matches!(
            plan_response(206, &partial(100, 999, 1000), 100),
            ResponsePlan::Write {
                start: 100,
                total: 1000,
                resumable: true,
                restarted: false
            }
        ));
    }

    #[test]
    fn ignored_range_restarts() {
        let meta = ResponseMeta {
            content_length: Some(1000),
            ..ResponseMeta::default()
        };
        assert!(matches!(
            plan_response(200, &meta, 100),
            ResponsePlan::Write {
                start: 0,
                total: 1000,
                resumable: false,
                restarted: true
            }
        ));
        assert!(matches!(
            plan_response(206, &partial(0, 999, 1000), 100),
            ResponsePlan::Write {
                start: 0,
                total: 1000,
                resumable: true,
                restarted: true
            }
        ));
    }

    #[test]
    fn fresh_download_with_accept_ranges() {
        let meta = ResponseMeta {
            content_length: Some(10),
            accept_ranges: true,
            ..ResponseMeta::default()
        };
        assert!(matches!(
            plan_response(200, &meta, 0),
            ResponsePlan::Write {
                resumable: true,
                restarted: false,
                ..
            }
        ));
    }

    #[test]
    fn unsatisfiable_range() {
        let meta = ResponseMeta {
            unsatisfied_total: Some(100),
            ..ResponseMeta::default()
        };
        assert!(matches!(
            plan_response(416, &meta, 100),
            ResponsePlan::AlreadyComplete { total: 100 }
        ));
        assert!(matches!(
            plan_response(416, &meta, 150),
            ResponsePlan::RetryWithoutRange
        ));
        assert!(matches!(
            plan_response(416, &meta, 0),
            ResponsePlan::Fail(TransferError::Protocol { status: 416 })
        ));
    }

    #[test]
    fn error_statuses_fail() {
        assert!(matches!(
            plan_response(404, &ResponseMeta::default(), 0),
            ResponsePlan::Fail(TransferError::Protocol { status: 404 })
        ));
        assert!(matches!(
            plan_response(206, &partial(50, 99, 100), 10),
            ResponsePlan::Fail(TransferError::Network(_))
        ));
    }

    #[test]
    fn short_body_is_network_error() {
        assert!(check_complete(10, 10).is_ok());
        assert!(check_complete(10, 0).is_ok());
        assert!(matches!(check_complete(5, 10), Err(TransferError::Network(_))));
    }
}
