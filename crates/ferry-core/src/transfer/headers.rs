//! Response metadata shared by both transports and the link probe.

use serde::Serialize;

/// `Content-Range: bytes start-end/total` (total may be `*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

/// The response headers the engine cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResponseMeta {
    pub content_length: Option<u64>,
    pub content_range: Option<ContentRange>,
    /// Only for 416 answers: `bytes */total`.
    pub unsatisfied_total: Option<u64>,
    pub accept_ranges: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
}

impl ResponseMeta {
    /// Fold one `Name: value` header in. Unknown names are ignored.
    pub fn apply(&mut self, name: &str, value: &str) {
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "content-length" => self.content_length = value.parse().ok(),
            "content-range" => {
                self.content_range = parse_content_range(value);
                self.unsatisfied_total = parse_unsatisfied_range(value);
            }
            "accept-ranges" => self.accept_ranges = value.eq_ignore_ascii_case("bytes"),
            "etag" => self.etag = Some(value.to_string()),
            "last-modified" => self.last_modified = Some(value.to_string()),
            "content-type" => self.content_type = Some(value.to_string()),
            "content-disposition" => self.content_disposition = Some(value.to_string()),
            _ => {}
        }
    }

    /// Parse raw header lines (as libcurl delivers them). A new status line
    /// starts over, so only the final response of a redirect chain counts.
    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut meta = Self::default();
        for line in lines {
            let line = line.trim_end();
            if line.starts_with("HTTP/") {
                meta = Self::default();
            } else if let Some((name, value)) = line.split_once(':') {
                meta.apply(name, value);
            }
        }
        meta
    }

    pub fn from_header_map(headers: &reqwest::header::HeaderMap) -> Self {
        let mut meta = Self::default();
        for (name, value) in headers {
            if let Ok(v) = value.to_str() {
                meta.apply(name.as_str(), v);
            }
        }
        meta
    }

    /// Full size of the resource: from `Content-Range` for partial answers,
    /// else `Content-Length` (0 if unknown).
    pub fn resource_size(&self, partial: bool) -> u64 {
        if partial {
            if let Some(cr) = self.content_range {
                return cr
                    .total
                    .unwrap_or_else(|| cr.end.saturating_add(1));
            }
        }
        self.content_length.unwrap_or(0)
    }
}

fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some(ContentRange {
        start: start.trim().parse().ok()?,
        end: end.trim().parse().ok()?,
        total,
    })
}

fn parse_unsatisfied_range(value: &str) -> Option<u64> {
    value
        .strip_prefix("bytes")?
        .trim_start()
        .strip_prefix("*/")?
        .trim()
        .parse()
        .ok()
}
