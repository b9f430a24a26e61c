//! Bandwidth governor: the rate a transfer may use right now.
//!
//! A profile has an optional fixed cap and an optional time-of-day window
//! with its own cap. Windows may wrap midnight (`22:00`-`06:00`) and include
//! both ends; equal ends cover the whole day. A zero cap means unlimited.

mod hhmm;

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{Local, NaiveTime};
use serde::{Deserialize, Serialize};

/// Permitted transfer rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimit {
    Unlimited,
    BytesPerSec(u64),
}

impl RateLimit {
    fn from_cap(cap: u64) -> Self {
        if cap == 0 {
            RateLimit::Unlimited
        } else {
            RateLimit::BytesPerSec(cap)
        }
    }
}

impl std::fmt::Display for RateLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimit::Unlimited => f.write_str("unlimited"),
            RateLimit::BytesPerSec(n) => write!(f, "{n} B/s"),
        }
    }
}

/// Daily window `[start, end]` in local time with its own cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
    pub bytes_per_sec: u64,
}

impl TimeWindow {
    /// Both ends inclusive; `start > end` wraps past midnight and
    /// `start == end` is all day.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start == self.end {
            return true;
        }
        if self.start < self.end {
            self.start <= t && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes_per_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<TimeWindow>,
}

impl BandwidthProfile {
    pub fn fixed(bytes_per_sec: u64) -> Self {
        Self {
            max_bytes_per_sec: Some(bytes_per_sec),
            window: None,
        }
    }

    pub fn fixed_limit(&self) -> RateLimit {
        RateLimit::from_cap(self.max_bytes_per_sec.unwrap_or(0))
    }

    /// Window cap inside the window, else the fixed cap, else unlimited.
    pub fn limit_at(&self, t: NaiveTime) -> RateLimit {
        match &self.window {
            Some(w) if w.contains(t) => RateLimit::from_cap(w.bytes_per_sec),
            _ => self.fixed_limit(),
        }
    }
}

/// Default profile plus per-owner overrides, changeable at runtime.
#[derive(Debug, Default)]
pub struct BandwidthGovernor {
    default: RwLock<BandwidthProfile>,
    owners: RwLock<HashMap<String, BandwidthProfile>>,
}

impl BandwidthGovernor {
    pub fn new(default: BandwidthProfile, owners: HashMap<String, BandwidthProfile>) -> Self {
        Self {
            default: RwLock::new(default),
            owners: RwLock::new(owners),
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Replace the profile for `owner`.
    pub fn set_profile(&self, owner: &str, profile: BandwidthProfile) {
        tracing::info!(owner, ?profile, "bandwidth profile updated");
        self.owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(owner.to_string(), profile);
    }

    pub fn clear_profile(&self, owner: &str) {
        self.owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(owner);
    }

    /// Profile that applies to `owner` (own profile, else the default).
    pub fn profile_for(&self, owner: &str) -> BandwidthProfile {
        let owners = self.owners.read().unwrap_or_else(PoisonError::into_inner);
        match owners.get(owner) {
            Some(p) => p.clone(),
            None => self
                .default
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Limit for `owner` at the current local wall-clock time.
    pub fn current_limit(&self, owner: &str) -> RateLimit {
        self.current_limit_at(owner, Local::now().time())
    }

    pub fn current_limit_at(&self, owner: &str, t: NaiveTime) -> RateLimit {
        self.profile_for(owner).limit_at(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn night_profile() -> BandwidthProfile {
        BandwidthProfile {
            max_bytes_per_sec: Some(100_000),
            window: Some(TimeWindow {
                start: hm(22, 0),
                end: hm(6, 0),
                bytes_per_sec: 1_000_000,
            }),
        }
    }

    #[test]
    fn window_wraps_midnight() {
        let p = night_profile();
        assert_eq!(p.limit_at(hm(23, 0)), RateLimit::BytesPerSec(1_000_000));
        assert_eq!(p.limit_at(hm(3, 0)), RateLimit::BytesPerSec(1_000_000));
        assert_eq!(p.limit_at(hm(22, 0)), RateLimit::BytesPerSec(1_000_000));
        assert_eq!(p.limit_at(hm(6, 0)), RateLimit::BytesPerSec(1_000_000));
        assert_eq!(p.limit_at(hm(12, 0)), RateLimit::BytesPerSec(100_000));
        assert_eq!(p.limit_at(hm(6, 1)), RateLimit::BytesPerSec(100_000));
    }

    #[test]
    fn daytime_window() {
        let p = BandwidthProfile {
            max_bytes_per_sec: None,
            window: Some(TimeWindow {
                start: hm(9, 0),
                end: hm(17, 0),
                bytes_per_sec: 50_000,
            }),
        };
        assert_eq!(p.limit_at(hm(9, 0)), RateLimit::BytesPerSec(50_000));
        assert_eq!(p.limit_at(hm(17, 30)), RateLimit::Unlimited);
        assert_eq!(p.limit_at(hm(8, 59)), RateLimit::Unlimited);
    }

    #[test]
    fn equal_ends_cover_the_whole_day() {
        let w = TimeWindow {
            start: hm(8, 0),
            end: hm(8, 0),
            bytes_per_sec: 10,
        };
        for t in [hm(0, 0), hm(7, 59), hm(8, 0), hm(8, 1), hm(23, 59)] {
            assert!(w.contains(t), "{t} outside an all-day window");
        }
    }

    #[test]
    fn zero_means_unlimited() {
        assert_eq!(BandwidthProfile::fixed(0).fixed_limit(), RateLimit::Unlimited);
        assert_eq!(BandwidthProfile::default().fixed_limit(), RateLimit::Unlimited);
    }

    #[test]
    fn owner_profile_overrides_default() {
        let gov = BandwidthGovernor::new(BandwidthProfile::fixed(1000), HashMap::new());
        assert_eq!(gov.current_limit_at("alice", hm(12, 0)), RateLimit::BytesPerSec(1000));
        gov.set_profile("alice", night_profile());
        assert_eq!(gov.current_limit_at("alice", hm(12, 0)), RateLimit::BytesPerSec(100_000));
        assert_eq!(gov.current_limit_at("bob", hm(12, 0)), RateLimit::BytesPerSec(1000));
        gov.clear_profile("alice");
        assert_eq!(gov.current_limit_at("alice", hm(23, 0)), RateLimit::BytesPerSec(1000));
    }

    #[test]
    fn window_toml_uses_hh_mm() {
        let p: BandwidthProfile = toml::from_str(
            r#"
            [window]
            start = "22:30"
            end = "06:00"
            bytes_per_sec = 10
            "#,
        )
        .unwrap();
        let w = p.window.unwrap();
        assert_eq!(w.start, hm(22, 30));
        assert!(toml::to_string(&w).unwrap().contains("\"22:30\""));
    }
}
