//! Local file naming: names derived from URLs and response headers.
//!
//! Everything here is a pure function of its inputs, apart from
//! `unique_path`, which consults the filesystem.

mod disposition;
mod mime;
mod sanitize;

use std::path::{Path, PathBuf};

pub use disposition::filename_from_disposition;
pub use mime::extension_for_content_type;
pub use sanitize::sanitize_filename;

/// Name used when neither the URL nor the headers give anything usable.
pub const FALLBACK_NAME: &str = "download.bin";

/// Last non-empty path segment of `url`, percent-decoded.
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    Some(disposition::percent_decode(segment))
}

/// File name to save `url` under: `Content-Disposition` first, then the URL
/// path, sanitized; `download.bin` when both are unusable.
pub fn derive_filename(url: &str, content_disposition: Option<&str>) -> String {
    content_disposition
        .and_then(filename_from_disposition)
        .map(|n| sanitize_filename(&n))
        .filter(|n| !n.is_empty())
        .or_else(|| {
            filename_from_url(url)
                .map(|n| sanitize_filename(&n))
                .filter(|n| !n.is_empty())
        })
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

/// `dir/name`, or `dir/stem_N.ext` for the first N that is neither on disk
/// nor rejected by `taken`.
pub fn unique_path(dir: &Path, name: &str, taken: impl Fn(&Path) -> bool) -> PathBuf {
    let first = dir.join(name);
    if !first.exists() && !taken(&first) {
        return first;
    }
    let (stem, ext) = split_extension(name);
    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem}_{n}.{ext}")),
            None => dir.join(format!("{stem}_{n}")),
        })
        .find(|p| !p.exists() && !taken(p))
        .unwrap_or(first)
}

/// `path` with an extension appended when it has none and `content_type`
/// maps to one. Returns `None` when nothing would change.
pub fn with_inferred_extension(path: &Path, content_type: Option<&str>) -> Option<PathBuf> {
    if path.extension().is_some() {
        return None;
    }
    let ext = extension_for_content_type(content_type?)?;
    let mut name = path.file_name()?.to_os_string();
    name.push(".");
    name.push(ext);
    Some(path.with_file_name(name))
}

fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}
