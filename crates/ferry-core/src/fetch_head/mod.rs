//! Link probe: a HEAD request reporting what a download would get.
//!
//! Blocking (libcurl); call through `probe_async` from async code.

use std::str;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::transfer::ResponseMeta;
use crate::url_model;

/// What the server says about a URL without sending the body.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub url: String,
    /// URL after redirects.
    pub effective_url: String,
    pub status: u16,
    pub size: Option<u64>,
    pub resumable: bool,
    pub content_type: Option<String>,
    /// Name a directory destination would get.
    pub suggested_filename: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl ProbeReport {
    pub fn is_reachable(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

pub fn probe(url: &str, timeout: Duration) -> Result<ProbeReport> {
    let mut lines: Vec<String> = Vec::new();

    let mut easy = curl::easy::Easy::new();
    easy.url(url).context("invalid URL")?;
    easy.nobody(true)?;
    easy.follow_location(true)?;
    easy.max_redirections(10)?;
    easy.connect_timeout(timeout)?;
    easy.timeout(timeout)?;
    {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            if let Ok(s) = str::from_utf8(data) {
                lines.push(s.trim_end().to_string());
            }
            true
        })?;
        transfer.perform().context("HEAD request failed")?;
    }

    let status = easy.response_code().context("no response code")? as u16;
    let effective_url = easy
        .effective_url()?
        .map(str::to_string)
        .unwrap_or_else(|| url.to_string());
    let meta = ResponseMeta::from_lines(lines.iter().map(String::as_str));
    Ok(report(url, effective_url, status, meta))
}

pub async fn probe_async(url: &str, timeout: Duration) -> Result<ProbeReport> {
    let url = url.to_string();
    tokio::task::spawn_blocking(move || probe(&url, timeout)).await?
}

fn report(url: &str, effective_url: String, status: u16, meta: ResponseMeta) -> ProbeReport {
    let mut name = url_model::derive_filename(&effective_url, meta.content_disposition.as_deref());
    let probe_path = std::path::Path::new(&name);
    if let Some(with_ext) = url_model::with_inferred_extension(probe_path, meta.content_type.as_deref()) {
        name = with_ext.to_string_lossy().into_owned();
    }
    ProbeReport {
        url: url.to_string(),
        effective_url,
        status,
        size: meta.content_length,
        resumable: meta.accept_ranges,
        content_type: meta.content_type,
        suggested_filename: name,
        etag: meta.etag,
        last_modified: meta.last_modified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_from_headers() {
        let meta = ResponseMeta::from_lines([
            "HTTP/1.1 200 OK",
            "Content-Length: 2048",
            "Accept-Ranges: bytes",
            "Content-Type: application/pdf",
        ]);
        let r = report(
            "https://example.com/get?id=1",
            "https://cdn.example.com/files/manual".into(),
            200,
            meta,
        );
        assert_eq!(r.size, Some(2048));
        assert!(r.resumable);
        assert_eq!(r.suggested_filename, "manual.pdf");
        assert!(r.is_reachable());
    }

    #[test]
    fn disposition_names_win() {
        let meta = ResponseMeta::from_lines([
            "HTTP/1.1 200 OK",
            "Content-Disposition: attachment; filename=\"data.csv\"",
        ]);
        let r = report("https://example.com/x", "https://example.com/x".into(), 200, meta);
        assert_eq!(r.suggested_filename, "data.csv");
        assert!(!r.resumable);
    }
}
