//! Wall-clock source for record timestamps and cache expiry.
//!
//! The engine never reads the system time directly. Every component that
//! needs "now" receives a [`Clock`], so tests can drive time explicitly.

use crate::Timestamp;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A source of millisecond timestamps.
pub trait Clock: Debug + Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> Timestamp;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by the operating system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Timestamp {
        let millis = chrono::Utc::now().timestamp_millis();
        u64::try_from(millis).unwrap_or(0)
    }
}

impl SystemClock {
    /// Create a shared system clock.
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Create a shared manual clock, returning both the concrete handle and
    /// the trait object.
    pub fn shared(start: Timestamp) -> (Arc<ManualClock>, SharedClock) {
        let clock = Arc::new(ManualClock::new(start));
        let shared: SharedClock = clock.clone();
        (clock, shared)
    }

    /// Move the clock forward.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, millis: Timestamp) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Format a millisecond timestamp as an RFC 3339 string (UTC).
pub fn to_rfc3339(millis: Timestamp) -> String {
    chrono::DateTime::from_timestamp_millis(millis as i64)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_default()
}

/// Business day (`YYYY-MM-DD`, UTC) for a millisecond timestamp.
pub fn business_day(millis: Timestamp) -> String {
    chrono::DateTime::from_timestamp_millis(millis as i64)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// Parse a timestamp given as milliseconds, a numeric string, or an
/// RFC 3339 / `YYYY-MM-DD` string.
pub fn parse_timestamp(value: &serde_json::Value) -> Option<Timestamp> {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            if let Ok(n) = trimmed.parse::<u64>() {
                return Some(n);
            }
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(trimmed) {
                return u64::try_from(dt.timestamp_millis()).ok();
            }
            chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .and_then(|dt| u64::try_from(dt.and_utc().timestamp_millis()).ok())
        }
        _ => None,
    }
}
