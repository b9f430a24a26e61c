use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::bandwidth::BandwidthProfile;
use crate::retry::RetryPolicy;

/// Retry policy parameters (optional section in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts per job (including the first).
    pub max_attempts: u32,
    /// Base delay in seconds for exponential backoff (e.g. 0.25 = 250ms).
    pub base_delay_secs: f64,
    /// Maximum backoff delay in seconds.
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 5.0,
            max_delay_secs: 60,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_secs_f64(self.base_delay_secs.max(0.0)),
            max_delay: Duration::from_secs(self.max_delay_secs),
        }
    }
}

/// Transport strategies, tried in the configured order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Async reqwest client.
    Http,
    /// libcurl easy handle on a blocking thread.
    Curl,
}

/// Bandwidth section: default profile plus per-owner overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BandwidthConfig {
    #[serde(flatten)]
    pub default: BandwidthProfile,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub owners: HashMap<String, BandwidthProfile>,
}

/// Global configuration loaded from `~/.config/ferry/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FerryConfig {
    /// Maximum number of jobs admitted or transferring at once.
    pub max_concurrent: usize,
    /// Directory used when a submission names no destination.
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    /// Write granularity for the streaming loop.
    pub chunk_size: usize,
    /// No body bytes for this long is a network error.
    pub read_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Minimum spacing between progress reports for one job.
    pub progress_interval_ms: u64,
    /// Checkpoint after this many bytes since the last save...
    pub checkpoint_every_bytes: u64,
    /// ...or after this many seconds, whichever comes first.
    pub checkpoint_every_secs: u64,
    /// Time scheduler sweep interval.
    pub schedule_sweep_secs: u64,
    /// Append an extension inferred from response headers when the destination has none.
    #[serde(default = "default_true")]
    pub infer_extension: bool,
    /// Rewrite Google Drive, Dropbox and OneDrive share links to direct downloads.
    #[serde(default = "default_true")]
    pub resolve_share_links: bool,
    /// Ordered transport strategies.
    #[serde(default = "default_transports")]
    pub transports: Vec<TransportKind>,
    /// Override for the checkpoint/history/socket directory.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Optional retry policy; if missing, built-in defaults are used.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub bandwidth: BandwidthConfig,
}

fn default_true() -> bool {
    true
}

fn default_transports() -> Vec<TransportKind> {
    vec![TransportKind::Http, TransportKind::Curl]
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            download_dir: None,
            chunk_size: 64 * 1024,
            read_timeout_secs: 30,
            connect_timeout_secs: 15,
            progress_interval_ms: 250,
            checkpoint_every_bytes: 1024 * 1024,
            checkpoint_every_secs: 5,
            schedule_sweep_secs: 5,
            infer_extension: true,
            resolve_share_links: true,
            transports: default_transports(),
            state_dir: None,
            retry: None,
            bandwidth: BandwidthConfig::default(),
        }
    }
}

impl FerryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_default().policy()
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_sweep_secs.max(1))
    }

    /// State directory: explicit override or `~/.local/state/ferry`.
    pub fn resolve_state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.state_dir {
            return Ok(dir.clone());
        }
        default_state_dir()
    }
}

/// `~/.local/state/ferry` on Debian-like systems.
pub fn default_state_dir() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("ferry")?;
    Ok(xdg_dirs.get_state_home())
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("ferry")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<FerryConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = FerryConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: FerryConfig = toml::from_str(&data)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandwidth::RateLimit;

    #[test]
    fn default_config_values() {
        let cfg = FerryConfig::default();
        assert_eq!(cfg.max_concurrent, 3);
        assert_eq!(cfg.chunk_size, 65536);
        assert_eq!(cfg.transports, vec![TransportKind::Http, TransportKind::Curl]);
        let policy = cfg.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(5));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = FerryConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: FerryConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.max_concurrent, cfg.max_concurrent);
        assert_eq!(parsed.checkpoint_every_bytes, cfg.checkpoint_every_bytes);
        assert_eq!(parsed.transports, cfg.transports);
    }

    #[test]
    fn config_toml_custom_values() {
        let toml = r#"
            max_concurrent = 2
            chunk_size = 16384
            read_timeout_secs = 10
            connect_timeout_secs = 5
            progress_interval_ms = 100
            checkpoint_every_bytes = 4096
            checkpoint_every_secs = 1
            schedule_sweep_secs = 2
            transports = ["curl"]
        "#;
        let cfg: FerryConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.max_concurrent, 2);
        assert_eq!(cfg.transports, vec![TransportKind::Curl]);
        assert!(cfg.infer_extension);
        assert!(cfg.resolve_share_links);
        assert!(cfg.retry.is_none());
        assert!(cfg.bandwidth.default.max_bytes_per_sec.is_none());
    }

    #[test]
    fn config_toml_retry_and_bandwidth() {
        let toml = r#"
            max_concurrent = 4
            chunk_size = 65536
            read_timeout_secs = 30
            connect_timeout_secs = 15
            progress_interval_ms = 250
            checkpoint_every_bytes = 1048576
            checkpoint_every_secs = 5
            schedule_sweep_secs = 5

            [retry]
            max_attempts = 5
            base_delay_secs = 0.5
            max_delay_secs = 15

            [bandwidth]
            max_bytes_per_sec = 1_000_000

            [bandwidth.window]
            start = "22:00"
            end = "06:00"
            bytes_per_sec = 250_000

            [bandwidth.owners.alice]
            max_bytes_per_sec = 10_000
        "#;
        let cfg: FerryConfig = toml::from_str(toml).unwrap();
        let retry = cfg.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 5);
        assert!((retry.base_delay_secs - 0.5).abs() < 1e-9);
        assert_eq!(cfg.bandwidth.default.max_bytes_per_sec, Some(1_000_000));
        let window = cfg.bandwidth.default.window.as_ref().unwrap();
        assert_eq!(window.bytes_per_sec, 250_000);
        let alice = &cfg.bandwidth.owners["alice"];
        assert_eq!(alice.fixed_limit(), RateLimit::BytesPerSec(10_000));
    }
}
