//! `ferry probe <url>` – HEAD request summary.

use std::time::Duration;

use anyhow::Result;
use ferry_core::fetch_head;
use ferry_core::transfer::{ShareLinkResolver, TransferSettings};

use super::mib;

pub async fn run_probe(url: &str, timeout_secs: u64) -> Result<()> {
    let target = ShareLinkResolver::new(&TransferSettings::default())
        .resolve(url)
        .await;
    if target != url {
        println!("Share link: {url}");
    }
    let report = fetch_head::probe_async(&target, Duration::from_secs(timeout_secs)).await?;
    println!("URL:        {}", report.url);
    if report.effective_url != report.url {
        println!("Redirected: {}", report.effective_url);
    }
    println!("Status:     {}", report.status);
    match report.size {
        Some(n) => println!("Size:       {n} bytes ({:.1} MiB)", mib(n)),
        None => println!("Size:       unknown"),
    }
    println!("Resumable:  {}", if report.resumable { "yes" } else { "no" });
    if let Some(ct) = &report.content_type {
        println!("Type:       {ct}");
    }
    println!("File name:  {}", report.suggested_filename);
    if let Some(etag) = &report.etag {
        println!("ETag:       {etag}");
    }
    if !report.is_reachable() {
        anyhow::bail!("server answered {}", report.status);
    }
    Ok(())
}
