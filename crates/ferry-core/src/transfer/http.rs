//! Async transport on `reqwest`.

use std::path::Path;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{IF_RANGE, RANGE};
use tokio::io::AsyncWriteExt;

use super::{
    check_complete, plan_response, AttemptEnv, ResponseMeta, ResponsePlan, Throttle,
    TransferOutcome, TransferRequest, TransferSettings, Transport, USER_AGENT,
};
use crate::retry::{classify_reqwest_error, TransferError};
use crate::storage;

pub struct HttpTransport {
    /// Construction failure (e.g. TLS backend init) makes the strategy unavailable.
    client: Result<reqwest::Client, String>,
}

impl HttpTransport {
    pub fn new(settings: &TransferSettings) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(|e| e.to_string());
        if let Err(e) = &client {
            tracing::warn!(error = %e, "http transport unavailable");
        }
        Self { client }
    }

    async fn send(
        &self,
        client: &reqwest::Client,
        req: &TransferRequest,
        offset: u64,
        env: &AttemptEnv,
    ) -> Result<reqwest::Response, TransferError> {
        let mut rb = client.get(&req.url);
        if offset > 0 {
            rb = rb.header(RANGE, format!("bytes={offset}-"));
            if let Some(v) = &req.if_range {
                rb = rb.header(IF_RANGE, v.as_str());
            }
        }
        tokio::select! {
            r = rb.send() => r.map_err(|e| classify_reqwest_error(&e)),
            _ = env.abort.aborted() => Err(TransferError::Aborted),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(
        &self,
        req: &TransferRequest,
        env: &AttemptEnv,
    ) -> Result<TransferOutcome, TransferError> {
        let client = self
            .client
            .as_ref()
            .map_err(|e| TransferError::Unavailable(e.clone()))?;
        let mut offset = req.resume_from;
        loop {
            let resp = self.send(client, req, offset, env).await?;
            let status = resp.status().as_u16();
            let meta = ResponseMeta::from_header_map(resp.headers());
            tracing::debug!(job_id = %req.job_id, status, offset, "response");
            match plan_response(status, &meta, offset) {
                ResponsePlan::Fail(e) => return Err(e),
                ResponsePlan::RetryWithoutRange => {
                    tracing::info!(job_id = %req.job_id, offset, "range not satisfiable, requesting whole file");
                    env.progress.restarted(0);
                    offset = 0;
                }
                ResponsePlan::AlreadyComplete { total } => {
                    return Ok(TransferOutcome {
                        bytes_written: total,
                        bytes_total: total,
                        meta,
                    });
                }
                ResponsePlan::Write {
                    start,
                    total,
                    resumable,
                    restarted,
                } => {
                    if restarted {
                        env.progress.restarted(total);
                    }
                    env.checkpoints
                        .begin_response(
                            resumable,
                            start,
                            total,
                            meta.etag.clone(),
                            meta.last_modified.clone(),
                        )
                        .await;
                    let written = stream_body(resp, &req.part_path, start, total, req, env).await?;
                    return Ok(TransferOutcome {
                        bytes_written: written,
                        bytes_total: if total > 0 { total } else { written },
                        meta,
                    });
                }
            }
        }
    }
}

async fn stream_body(
    resp: reqwest::Response,
    part: &Path,
    start: u64,
    total: u64,
    req: &TransferRequest,
    env: &AttemptEnv,
) -> Result<u64, TransferError> {
    let mut file = storage::open_part(part, start).await?;
    let mut done = start;
    let mut throttle = Throttle::new(env.governor.clone(), &req.owner);
    let mut stream = resp.bytes_stream();
    env.progress.report(done, total);

    let result = loop {
        let next = tokio::select! {
            biased;
            _ = env.abort.aborted() => break Err(TransferError::Aborted),
            r = tokio::time::timeout(env.settings.read_timeout, stream.next()) => r,
        };
        let chunk = match next {
            Err(_) => {
                break Err(TransferError::Timeout(format!(
                    "no data for {}s",
                    env.settings.read_timeout.as_secs()
                )))
            }
            Ok(None) => break Ok(()),
            Ok(Some(Err(e))) => break Err(classify_reqwest_error(&e)),
            Ok(Some(Ok(chunk))) => chunk,
        };
        if let Err(e) = file.write_all(&chunk).await {
            break Err(TransferError::Storage(e));
        }
        done += chunk.len() as u64;
        env.progress.report(done, total.max(done));
        if env.checkpoints.due(done) {
            if let Err(e) = file.flush().await {
                break Err(TransferError::Storage(e));
            }
            env.checkpoints.save(done).await;
        }
        if !throttle.pace(chunk.len() as u64, &env.abort).await {
            break Err(TransferError::Aborted);
        }
    };

    // Land what we have on disk before reporting, success or not.
    let flushed = file.flush().await;
    match result {
        Ok(()) => {
            flushed?;
            file.sync_data().await?;
            check_complete(done, total)?;
            Ok(done)
        }
        Err(e) => {
            tracing::debug!(job_id = %req.job_id, bytes = done, error = %e, "attempt stopped");
            Err(e)
        }
    }
}
