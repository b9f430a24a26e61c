//! Minimal HTTP/1.1 server for integration tests.
//!
//! Serves one static body with Range support and a few ways to misbehave:
//! failing the first requests, cutting a body short, sending slowly, or
//! ignoring ranges. Every GET is counted with the range it asked for.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// If false, omit `Accept-Ranges: bytes`.
    pub advertise_ranges: bool,
    /// The first N GETs answer 503.
    pub fail_first: usize,
    /// Every GET answers this status with an empty body.
    pub always_status: Option<u16>,
    /// The first successful GET closes the connection after this many body bytes.
    pub cut_first_after: Option<usize>,
    /// Send the body in pieces of this size with a pause after each.
    pub pace: Option<(usize, Duration)>,
    pub content_type: Option<&'static str>,
    pub etag: Option<&'static str>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            support_ranges: true,
            advertise_ranges: true,
            fail_first: 0,
            always_status: None,
            cut_first_after: None,
            pace: None,
            content_type: None,
            etag: None,
        }
    }
}

/// One GET as the server saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenRequest {
    pub range_start: Option<u64>,
    pub if_range: Option<String>,
}

#[derive(Default)]
struct Stats {
    gets: AtomicUsize,
    served: AtomicUsize,
    seen: Mutex<Vec<SeenRequest>>,
}

pub struct TestServer {
    /// Base URL, e.g. `http://127.0.0.1:12345/`.
    pub base: String,
    stats: Arc<Stats>,
}

impl TestServer {
    /// URL of the served file under `name`.
    pub fn url(&self, name: &str) -> String {
        format!("{}{}", self.base, name)
    }

    pub fn gets(&self) -> usize {
        self.stats.gets.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.stats.seen.lock().unwrap().clone()
    }
}

/// Serve `body` with default options until the process exits.
pub fn start(body: Vec<u8>) -> TestServer {
    start_with_options(body, ServerOptions::default())
}

pub fn start_with_options(body: Vec<u8>, opts: ServerOptions) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let stats = Arc::new(Stats::default());
    let opts = Arc::new(opts);
    {
        let stats = Arc::clone(&stats);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let body = Arc::clone(&body);
                let stats = Arc::clone(&stats);
                let opts = Arc::clone(&opts);
                thread::spawn(move || handle(stream, &body, &opts, &stats));
            }
        });
    }
    TestServer {
        base: format!("http://127.0.0.1:{port}/"),
        stats,
    }
}

struct Request {
    method: String,
    range: Option<(u64, u64)>,
    if_range: Option<String>,
}

fn handle(mut stream: TcpStream, body: &[u8], opts: &ServerOptions, stats: &Stats) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
    let Some(req) = read_request(&mut stream) else {
        return;
    };
    let total = body.len() as u64;

    if req.method.eq_ignore_ascii_case("HEAD") {
        let head = headers("200 OK", total, None, opts);
        let _ = stream.write_all(head.as_bytes());
        return;
    }
    if !req.method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        return;
    }

    let n = stats.gets.fetch_add(1, Ordering::SeqCst);
    stats.seen.lock().unwrap().push(SeenRequest {
        range_start: req.range.map(|(s, _)| s),
        if_range: req.if_range.clone(),
    });
    if let Some(code) = opts.always_status {
        let _ = stream.write_all(
            format!("HTTP/1.1 {code} Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").as_bytes(),
        );
        return;
    }
    if n < opts.fail_first {
        let _ = stream.write_all(
            b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        return;
    }

    let validator_ok = match (&req.if_range, opts.etag) {
        (Some(sent), Some(etag)) => sent == etag,
        (Some(_), None) => false,
        (None, _) => true,
    };
    let range = req.range.filter(|_| opts.support_ranges && validator_ok);
    let (status, content_range, slice) = match range {
        Some((start, _)) if start >= total => {
            let head = format!(
                "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{total}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
            let _ = stream.write_all(head.as_bytes());
            return;
        }
        Some((start, end_incl)) => {
            let end_excl = end_incl.saturating_add(1).min(total);
            (
                "206 Partial Content",
                Some(format!("bytes {}-{}/{}", start, end_excl - 1, total)),
                &body[start as usize..end_excl as usize],
            )
        }
        None => ("200 OK", None, body),
    };

    let head = headers(status, slice.len() as u64, content_range.as_deref(), opts);
    if stream.write_all(head.as_bytes()).is_err() {
        return;
    }
    let served = stats.served.fetch_add(1, Ordering::SeqCst);
    let send = match opts.cut_first_after {
        Some(cut) if served == 0 => &slice[..cut.min(slice.len())],
        _ => slice,
    };
    match opts.pace {
        Some((piece, pause)) => {
            for chunk in send.chunks(piece.max(1)) {
                if stream.write_all(chunk).is_err() {
                    return;
                }
                let _ = stream.flush();
                thread::sleep(pause);
            }
        }
        None => {
            let _ = stream.write_all(send);
        }
    }
    let _ = stream.flush();
    let _ = stream.shutdown(std::net::Shutdown::Both);
}

fn headers(status: &str, len: u64, content_range: Option<&str>, opts: &ServerOptions) -> String {
    let mut out = format!("HTTP/1.1 {status}\r\nContent-Length: {len}\r\nConnection: close\r\n");
    if let Some(cr) = content_range {
        out.push_str(&format!("Content-Range: {cr}\r\n"));
    }
    if opts.advertise_ranges {
        out.push_str("Accept-Ranges: bytes\r\n");
    }
    if let Some(ct) = opts.content_type {
        out.push_str(&format!("Content-Type: {ct}\r\n"));
    }
    if let Some(etag) = opts.etag {
        out.push_str(&format!("ETag: {etag}\r\n"));
    }
    out.push_str("\r\n");
    out
}

/// Read up to the end of the request head.
fn read_request(stream: &mut TcpStream) -> Option<Request> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > 64 * 1024 {
            return None;
        }
    }
    let text = String::from_utf8_lossy(&buf);
    let mut lines = text.lines();
    let method = lines.next()?.split_whitespace().next()?.to_string();
    let mut range = None;
    let mut if_range = None;
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.trim().eq_ignore_ascii_case("range") {
            range = parse_range(value);
        } else if name.trim().eq_ignore_ascii_case("if-range") {
            if_range = Some(value.to_string());
        }
    }
    Some(Request {
        method,
        range,
        if_range,
    })
}

/// `bytes=X-` or `bytes=X-Y` as (start, end inclusive).
fn parse_range(value: &str) -> Option<(u64, u64)> {
    let set = value.strip_prefix("bytes=")?;
    let (a, b) = set.split_once('-')?;
    let start = a.trim().parse::<u64>().ok()?;
    let end = match b.trim() {
        "" => u64::MAX,
        e => e.parse::<u64>().ok()?,
    };
    Some((start, end))
}
