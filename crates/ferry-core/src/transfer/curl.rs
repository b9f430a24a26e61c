//! libcurl transport on a blocking thread; the fallback strategy.

use std::cell::RefCell;
use std::io::Write;
use std::str;

use async_trait::async_trait;

use super::{
    check_complete, plan_response, AttemptEnv, ResponseMeta, ResponsePlan, Throttle,
    TransferOutcome, TransferRequest, Transport, USER_AGENT,
};
use crate::retry::TransferError;
use crate::storage;

#[derive(Default)]
pub struct CurlTransport;

impl CurlTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for CurlTransport {
    fn name(&self) -> &'static str {
        "curl"
    }

    async fn fetch(
        &self,
        req: &TransferRequest,
        env: &AttemptEnv,
    ) -> Result<TransferOutcome, TransferError> {
        let req = req.clone();
        let env = env.clone();
        tokio::task::spawn_blocking(move || fetch_blocking(&req, &env))
            .await
            .map_err(|e| TransferError::Unavailable(format!("blocking task failed: {e}")))?
    }
}

fn fetch_blocking(req: &TransferRequest, env: &AttemptEnv) -> Result<TransferOutcome, TransferError> {
    let mut offset = req.resume_from;
    loop {
        match attempt(req, env, offset)? {
            Step::Done(outcome) => return Ok(outcome),
            Step::Restart => {
                tracing::info!(job_id = %req.job_id, offset, "range not satisfiable, requesting whole file");
                env.progress.restarted(0);
                offset = 0;
            }
        }
    }
}

enum Step {
    Done(TransferOutcome),
    Restart,
}

/// Body-writing state, created when the first body byte arrives.
struct Sink {
    file: std::fs::File,
    done: u64,
    total: u64,
    throttle: Throttle,
}

#[derive(Default)]
struct HeaderState {
    status: u16,
    lines: Vec<String>,
}

enum Decision {
    Undecided,
    Writing { meta: ResponseMeta },
    Complete { meta: ResponseMeta, total: u64 },
    Restart,
    Failed(TransferError),
}

/// Flush the body file; a failure becomes the attempt's error unless one is
/// already recorded.
fn flush_into(file: &mut impl Write, failure: &mut Option<TransferError>) {
    if let Err(e) = file.flush() {
        tracing::warn!(error = %e, "flushing part file failed");
        failure.get_or_insert(TransferError::Storage(e));
    }
}

fn curl_err(e: curl::Error) -> TransferError {
    if e.is_unsupported_protocol() || e.is_failed_init() {
        return TransferError::Unavailable(e.to_string());
    }
    if e.is_operation_timedout() {
        return TransferError::Timeout(e.to_string());
    }
    TransferError::network(e)
}

fn attempt(req: &TransferRequest, env: &AttemptEnv, offset: u64) -> Result<Step, TransferError> {
    let mut easy = curl::easy::Easy::new();
    easy.url(&req.url).map_err(curl_err)?;
    easy.useragent(USER_AGENT).map_err(curl_err)?;
    easy.follow_location(true).map_err(curl_err)?;
    easy.max_redirections(10).map_err(curl_err)?;
    easy.connect_timeout(env.settings.connect_timeout).map_err(curl_err)?;
    // Below 1 byte/s for read_timeout counts as a stalled read.
    easy.low_speed_limit(1).map_err(curl_err)?;
    easy.low_speed_time(env.settings.read_timeout).map_err(curl_err)?;
    easy.buffer_size(env.settings.chunk_size.min(512 * 1024)).map_err(curl_err)?;
    easy.progress(true).map_err(curl_err)?;
    if offset > 0 {
        easy.range(&format!("{offset}-")).map_err(curl_err)?;
        if let Some(v) = &req.if_range {
            let mut list = curl::easy::List::new();
            list.append(&format!("If-Range: {v}")).map_err(curl_err)?;
            easy.http_headers(list).map_err(curl_err)?;
        }
    }

    let headers = RefCell::new(HeaderState::default());
    let decision = RefCell::new(Decision::Undecided);
    let sink: RefCell<Option<Sink>> = RefCell::new(None);
    let failure: RefCell<Option<TransferError>> = RefCell::new(None);

    // Settle what to do with the body once all headers are in.
    let decide = || {
        let mut d = decision.borrow_mut();
        if !matches!(*d, Decision::Undecided) {
            return;
        }
        let h = headers.borrow();
        let meta = ResponseMeta::from_lines(h.lines.iter().map(String::as_str));
        *d = match plan_response(h.status, &meta, offset) {
            ResponsePlan::Fail(e) => Decision::Failed(e),
            ResponsePlan::RetryWithoutRange => Decision::Restart,
            ResponsePlan::AlreadyComplete { total } => Decision::Complete { meta, total },
            ResponsePlan::Write {
                start,
                total,
                resumable,
                restarted,
            } => {
                if restarted {
                    env.progress.restarted(total);
                }
                env.checkpoints.begin_response_blocking(
                    resumable,
                    start,
                    total,
                    meta.etag.clone(),
                    meta.last_modified.clone(),
                );
                match storage::open_part_blocking(&req.part_path, start) {
                    Ok(file) => {
                        env.progress.report(start, total);
                        *sink.borrow_mut() = Some(Sink {
                            file,
                            done: start,
                            total,
                            throttle: Throttle::new(env.governor.clone(), &req.owner),
                        });
                        Decision::Writing { meta }
                    }
                    Err(e) => Decision::Failed(TransferError::Storage(e)),
                }
            }
        };
    };

    let performed = {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                if let Ok(line) = str::from_utf8(data) {
                    let line = line.trim_end();
                    let mut h = headers.borrow_mut();
                    if line.starts_with("HTTP/") {
                        h.status = line
                            .split_whitespace()
                            .nth(1)
                            .and_then(|c| c.parse().ok())
                            .unwrap_or(0);
                        h.lines.clear();
                    }
                    h.lines.push(line.to_string());
                }
                true
            })
            .map_err(curl_err)?;
        transfer
            .write_function(|data| {
                decide();
                if !matches!(*decision.borrow(), Decision::Writing { .. }) {
                    // Error page or nothing to write: stop reading.
                    return Ok(0);
                }
                let mut guard = sink.borrow_mut();
                let Some(s) = guard.as_mut() else {
                    return Ok(0);
                };
                if let Err(e) = s.file.write_all(data) {
                    *failure.borrow_mut() = Some(TransferError::Storage(e));
                    return Ok(0);
                }
                s.done += data.len() as u64;
                env.progress.report(s.done, s.total.max(s.done));
                if env.checkpoints.due(s.done) {
                    if let Err(e) = s.file.flush() {
                        *failure.borrow_mut() = Some(TransferError::Storage(e));
                        return Ok(0);
                    }
                    env.checkpoints.save_blocking(s.done);
                }
                if !s.throttle.pace_blocking(data.len() as u64, &env.abort) {
                    *failure.borrow_mut() = Some(TransferError::Aborted);
                    return Ok(0);
                }
                Ok(data.len())
            })
            .map_err(curl_err)?;
        transfer
            .progress_function(|_, _, _, _| !env.abort.is_aborted())
            .map_err(curl_err)?;
        transfer.perform()
    };

    // Headers-only answers (HEAD-like 416, empty bodies) never hit write_function.
    decide();
    if let Some(s) = sink.borrow_mut().as_mut() {
        flush_into(&mut s.file, &mut failure.borrow_mut());
    }
    if let Some(e) = failure.into_inner() {
        return Err(e);
    }
    if env.abort.is_aborted() {
        return Err(TransferError::Aborted);
    }
    match decision.into_inner() {
        Decision::Failed(e) => Err(e),
        Decision::Restart => Ok(Step::Restart),
        Decision::Complete { meta, total } => Ok(Step::Done(TransferOutcome {
            bytes_written: total,
            bytes_total: total,
            meta,
        })),
        Decision::Undecided => Err(performed.err().map(curl_err).unwrap_or_else(|| {
            TransferError::network("no response")
        })),
        Decision::Writing { meta } => {
            performed.map_err(curl_err)?;
            let Some(s) = sink.into_inner() else {
                return Err(TransferError::network("no body"));
            };
            s.file.sync_data()?;
            check_complete(s.done, s.total)?;
            Ok(Step::Done(TransferOutcome {
                bytes_written: s.done,
                bytes_total: if s.total > 0 { s.total } else { s.done },
                meta,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"))
        }
    }

    #[test]
    fn failed_final_flush_is_a_storage_error() {
        let mut failure = None;
        flush_into(&mut FullDisk, &mut failure);
        assert!(matches!(failure, Some(TransferError::Storage(_))));

        let mut failure = Some(TransferError::Aborted);
        flush_into(&mut FullDisk, &mut failure);
        assert!(matches!(failure, Some(TransferError::Aborted)));

        let mut failure = None;
        flush_into(&mut Vec::<u8>::new(), &mut failure);
        assert!(failure.is_none());
    }

    #[test]
    fn init_failures_are_unavailable() {
        let e = curl::Error::new(1); // CURLE_UNSUPPORTED_PROTOCOL
        assert!(matches!(curl_err(e), TransferError::Unavailable(_)));
        let e = curl::Error::new(28); // CURLE_OPERATION_TIMEDOUT
        assert!(matches!(curl_err(e), TransferError::Timeout(_)));
        let e = curl::Error::new(7); // CURLE_COULDNT_CONNECT
        assert!(matches!(curl_err(e), TransferError::Network(_)));
    }
}
