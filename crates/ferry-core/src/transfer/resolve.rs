//! Share-link resolution: cloud "view" pages rewritten to URLs that return
//! the file itself.
//!
//! Google Drive, Dropbox and OneDrive share links are rewritten without any
//! network access. Two cases need a request first: large Drive files answer
//! with a virus-scan warning page whose confirm token must be carried over,
//! and `1drv.ms` short links only reveal their target by redirecting.

use reqwest::header::{CONTENT_TYPE, SET_COOKIE};
use url::Url;

use super::{TransferSettings, USER_AGENT};

/// Hosting service a share link belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudService {
    GoogleDrive,
    Dropbox,
    OneDrive,
}

impl CloudService {
    pub fn detect(url: &Url) -> Option<Self> {
        let host = url.host_str()?.to_ascii_lowercase();
        let is = |domain: &str| host == domain || host.ends_with(&format!(".{domain}"));
        if host == "drive.google.com" || host == "docs.google.com" {
            Some(CloudService::GoogleDrive)
        } else if is("dropbox.com") || host == "dl.dropboxusercontent.com" {
            Some(CloudService::Dropbox)
        } else if host == "1drv.ms" || is("onedrive.live.com") || is("sharepoint.com") {
            Some(CloudService::OneDrive)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloudService::GoogleDrive => "google-drive",
            CloudService::Dropbox => "dropbox",
            CloudService::OneDrive => "onedrive",
        }
    }
}

/// Direct-download form of a share link, computed offline. `None` for
/// anything that is not a recognised share link.
pub fn direct_url(raw: &str) -> Option<(CloudService, Url)> {
    let url = Url::parse(raw).ok()?;
    let service = CloudService::detect(&url)?;
    let direct = match service {
        CloudService::GoogleDrive => drive_download_url(&drive_file_id(&url)?)?,
        CloudService::Dropbox => dropbox_direct(url),
        CloudService::OneDrive => onedrive_direct(url),
    };
    Some((service, direct))
}

/// `https://drive.google.com/uc?export=download&id=<id>`.
fn drive_download_url(id: &str) -> Option<Url> {
    Url::parse_with_params(
        "https://drive.google.com/uc",
        [("export", "download"), ("id", id)],
    )
    .ok()
}

/// File id from `/file/d/<id>/...` (or the document, presentation and
/// spreadsheet equivalents) or an `id=` query parameter.
fn drive_file_id(url: &Url) -> Option<String> {
    let segments: Vec<&str> = url.path_segments().map(|s| s.collect()).unwrap_or_default();
    let from_path = segments.windows(3).find_map(|w| {
        let kind_ok = matches!(w[0], "file" | "document" | "presentation" | "spreadsheets");
        (kind_ok && w[1] == "d").then(|| w[2].to_string())
    });
    from_path
        .or_else(|| {
            url.query_pairs()
                .find(|(k, _)| k == "id")
                .map(|(_, v)| v.into_owned())
        })
        .filter(|id| is_token(id))
}

fn dropbox_direct(mut url: Url) -> Url {
    set_query(&mut url, "dl", "1");
    if matches!(url.host_str(), Some("www.dropbox.com" | "dropbox.com")) {
        if let Err(e) = url.set_host(Some("dl.dropboxusercontent.com")) {
            tracing::debug!(error = %e, "dropbox host kept");
        }
    }
    url
}

fn onedrive_direct(mut url: Url) -> Url {
    set_query(&mut url, "download", "1");
    url
}

/// Set `key=value`, replacing any existing values of `key` in place.
fn set_query(url: &mut Url, key: &str, value: &str) {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut seen = false;
    pairs.retain_mut(|(k, v)| {
        if k != key {
            return true;
        }
        if seen {
            return false;
        }
        seen = true;
        *v = value.to_string();
        true
    });
    if !seen {
        pairs.push((key.to_string(), value.to_string()));
    }
    url.query_pairs_mut().clear().extend_pairs(pairs);
}

fn is_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// The `[A-Za-z0-9_-]+` run right after the first `marker` in `hay`.
fn token_after(hay: &str, marker: &str) -> Option<String> {
    let rest = &hay[hay.find(marker)? + marker.len()..];
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .unwrap_or(rest.len());
    (end > 0).then(|| rest[..end].to_string())
}

/// Value of `name="..."` inside one tag.
fn attr<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!("{name}=\"");
    let rest = &tag[tag.find(&marker)? + marker.len()..];
    Some(&rest[..rest.find('"')?])
}

/// Confirm token on a Drive warning page, in any of the shapes Drive has
/// used: a `confirm=` link, a JSON field or a hidden form input.
pub fn confirm_token(html: &str) -> Option<String> {
    token_after(html, "confirm=")
        .or_else(|| token_after(html, "\"confirm\":\""))
        .or_else(|| {
            html.split("<input")
                .skip(1)
                .filter_map(|chunk| chunk.split('>').next())
                .find(|tag| attr(tag, "name") == Some("confirm"))
                .and_then(|tag| attr(tag, "value"))
                .filter(|v| is_token(v))
                .map(str::to_string)
        })
}

/// Download URL from a Drive warning page's form: its `action` plus every
/// hidden input. `None` unless the form carries a confirm field.
fn confirm_form(html: &str) -> Option<Url> {
    let form_tag = html.split("<form").nth(1)?.split('>').next()?;
    let mut url = Url::parse(&attr(form_tag, "action")?.replace("&amp;", "&")).ok()?;
    let inputs: Vec<(&str, &str)> = html
        .split("<input")
        .skip(1)
        .filter_map(|chunk| chunk.split('>').next())
        .filter(|tag| attr(tag, "type") == Some("hidden"))
        .filter_map(|tag| Some((attr(tag, "name")?, attr(tag, "value").unwrap_or(""))))
        .collect();
    if !inputs.iter().any(|(k, _)| *k == "confirm") {
        return None;
    }
    url.query_pairs_mut().extend_pairs(inputs);
    Some(url)
}

/// `download_warning*=<token>` from Drive's older cookie handshake.
fn warning_cookie(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|c| c.starts_with("download_warning"))
        .and_then(|c| token_after(c, "="))
}

/// Rewrites share links before a job's first attempt.
pub struct ShareLinkResolver {
    client: Option<reqwest::Client>,
}

impl ShareLinkResolver {
    pub fn new(settings: &TransferSettings) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.read_timeout)
            .build();
        match client {
            Ok(client) => Self {
                client: Some(client),
            },
            Err(e) => {
                tracing::warn!(error = %e, "share links will be rewritten offline only");
                Self { client: None }
            }
        }
    }

    /// URL to fetch for `raw`. Anything that is not a share link comes back
    /// unchanged; if the network step fails the offline rewrite is used.
    pub async fn resolve(&self, raw: &str) -> String {
        let Some((service, direct)) = direct_url(raw) else {
            return raw.to_string();
        };
        let resolved = match (&self.client, service) {
            (Some(client), CloudService::GoogleDrive) => {
                confirm_download(client, direct.clone()).await
            }
            (Some(client), CloudService::OneDrive)
                if direct.host_str() == Some("1drv.ms") =>
            {
                expand_short_link(client, raw).await
            }
            _ => Ok(direct.clone()),
        };
        let url = match resolved {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(service = service.as_str(), error = %e, "share link lookup failed, using offline rewrite");
                direct
            }
        };
        tracing::info!(service = service.as_str(), from = raw, to = %url, "share link resolved");
        url.to_string()
    }
}

/// Ask Drive for the file; a warning page means the confirm token has to
/// go on the URL.
async fn confirm_download(client: &reqwest::Client, direct: Url) -> reqwest::Result<Url> {
    let resp = client.get(direct.clone()).send().await?.error_for_status()?;
    if resp.url().query_pairs().any(|(k, _)| k == "confirm") {
        return Ok(resp.url().clone());
    }
    if let Some(token) = warning_cookie(resp.headers()) {
        let mut url = direct;
        set_query(&mut url, "confirm", &token);
        return Ok(url);
    }
    let html = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/html"));
    if !html {
        return Ok(direct);
    }
    let body = resp.text().await?;
    if let Some(url) = confirm_form(&body) {
        return Ok(url);
    }
    match confirm_token(&body) {
        Some(token) => {
            let mut url = direct;
            set_query(&mut url, "confirm", &token);
            Ok(url)
        }
        None => Ok(direct),
    }
}

/// Follow a `1drv.ms` redirect chain and ask the target for the file.
async fn expand_short_link(client: &reqwest::Client, raw: &str) -> reqwest::Result<Url> {
    let resp = client.get(raw).send().await?;
    Ok(onedrive_direct(resp.url().clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn direct(raw: &str) -> (CloudService, String) {
        let (service, url) = direct_url(raw).unwrap();
        (service, url.to_string())
    }

    #[test]
    fn drive_links_become_uc_downloads() {
        let want = "https://drive.google.com/uc?export=download&id=1AbC_d-9";
        for raw in [
            "https://drive.google.com/file/d/1AbC_d-9/view?usp=sharing",
            "https://drive.google.com/open?id=1AbC_d-9",
            "https://docs.google.com/document/d/1AbC_d-9/edit",
            "https://drive.google.com/uc?id=1AbC_d-9&export=download",
        ] {
            assert_eq!(direct(raw), (CloudService::GoogleDrive, want.to_string()), "{raw}");
        }
        // Folders have no file id.
        assert!(direct_url("https://drive.google.com/drive/folders/xyz").is_none());
    }

    #[test]
    fn dropbox_links_ask_for_the_file() {
        assert_eq!(
            direct("https://www.dropbox.com/s/abc123/report.pdf?dl=0").1,
            "https://dl.dropboxusercontent.com/s/abc123/report.pdf?dl=1"
        );
        assert_eq!(
            direct("https://www.dropbox.com/scl/fi/xyz/a.zip?rlkey=k1&dl=0").1,
            "https://dl.dropboxusercontent.com/scl/fi/xyz/a.zip?rlkey=k1&dl=1"
        );
        assert_eq!(
            direct("https://dl.dropboxusercontent.com/s/abc/f.bin").1,
            "https://dl.dropboxusercontent.com/s/abc/f.bin?dl=1"
        );
    }

    #[test]
    fn onedrive_links_get_download_flag() {
        assert_eq!(
            direct("https://onedrive.live.com/redir?resid=ABC!123&authkey=x"),
            (
                CloudService::OneDrive,
                "https://onedrive.live.com/redir?resid=ABC%21123&authkey=x&download=1".to_string()
            )
        );
        assert_eq!(
            direct("https://contoso.sharepoint.com/:u:/g/doc?e=1&download=0").1,
            "https://contoso.sharepoint.com/:u:/g/doc?e=1&download=1"
        );
        assert_eq!(direct("https://1drv.ms/u/s!Aa1").0, CloudService::OneDrive);
    }

    #[test]
    fn other_hosts_are_left_alone() {
        assert!(direct_url("https://example.com/file.iso").is_none());
        assert!(direct_url("https://notdropbox.com/s/x?dl=0").is_none());
        assert!(direct_url("not a url").is_none());
    }

    #[test]
    fn confirm_token_shapes() {
        assert_eq!(
            confirm_token(r#"<a href="/uc?export=download&amp;confirm=t0K-en_1&amp;id=x">"#).as_deref(),
            Some("t0K-en_1")
        );
        assert_eq!(confirm_token(r#"{"confirm":"abc"}"#).as_deref(), Some("abc"));
        assert_eq!(
            confirm_token(r#"<input type="hidden" name="confirm" value="t">"#).as_deref(),
            Some("t")
        );
        assert_eq!(confirm_token("<html>no luck</html>"), None);
    }

    #[test]
    fn warning_form_carries_every_hidden_field() {
        let html = r#"<form id="download-form" action="https://drive.usercontent.google.com/download" method="get">
            <input type="hidden" name="id" value="1AbC">
            <input type="hidden" name="export" value="download">
            <input type="hidden" name="confirm" value="t">
            <input type="hidden" name="uuid" value="u-1">
            <input type="submit" value="Download anyway"></form>"#;
        assert_eq!(
            confirm_form(html).unwrap().as_str(),
            "https://drive.usercontent.google.com/download?id=1AbC&export=download&confirm=t&uuid=u-1"
        );
        assert!(confirm_form(r#"<form action="https://x/">"#).is_none());
    }

    /// Answers one request with `response` and returns its base URL.
    async fn one_shot(response: &'static str) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = sock.read(&mut buf).await;
            sock.write_all(response.as_bytes()).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/uc?export=download&id=1AbC")).unwrap()
    }

    #[tokio::test]
    async fn drive_warning_page_adds_confirm_token() {
        let url = one_shot(concat!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\n",
            "Content-Length: 52\r\nConnection: close\r\n\r\n",
            "<a href=\"/uc?export=download&amp;confirm=Xy9\">go</a>"
        ))
        .await;
        let client = reqwest::Client::new();
        let got = confirm_download(&client, url.clone()).await.unwrap();
        assert_eq!(got.query_pairs().find(|(k, _)| k == "confirm").unwrap().1, "Xy9");
        assert_eq!(got.path(), url.path());
    }

    #[tokio::test]
    async fn drive_file_response_is_used_as_is() {
        let url = one_shot(concat!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/zip\r\n",
            "Content-Length: 4\r\nConnection: close\r\n\r\nPK\x03\x04"
        ))
        .await;
        let client = reqwest::Client::new();
        assert_eq!(confirm_download(&client, url.clone()).await.unwrap(), url);
    }

    #[tokio::test]
    async fn drive_cookie_handshake() {
        let url = one_shot(concat!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n",
            "Set-Cookie: download_warning_13058876669334088843_1AbC=Zq7; Path=/\r\n",
            "Content-Length: 0\r\nConnection: close\r\n\r\n"
        ))
        .await;
        let client = reqwest::Client::new();
        let got = confirm_download(&client, url).await.unwrap();
        assert!(got.as_str().ends_with("&confirm=Zq7"), "{got}");
    }

    #[tokio::test]
    async fn plain_urls_pass_through_the_resolver() {
        let resolver = ShareLinkResolver::new(&TransferSettings::default());
        assert_eq!(
            resolver.resolve("http://127.0.0.1:9/file.bin").await,
            "http://127.0.0.1:9/file.bin"
        );
    }
}
