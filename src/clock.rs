//! C1 — Clock & IDs.
//!
//! Monotonic wall time, unique 12/16-hex IDs, and timezone conversion live here so every
//! other component can take a `&dyn Clock` instead of reaching for `Utc::now()` directly,
//! per the "pluggable Clock trait" design note.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Abstracts wall-clock access so tests can pin time deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fixed-time clock for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// 12-hex-char id, e.g. message ids (`msg_<12 hex>` callers prefix themselves).
pub fn short_id() -> String {
    let mut buf = Uuid::new_v4().simple().to_string();
    buf.truncate(12);
    buf
}

/// 16-hex-char id, e.g. trace/span ids.
pub fn long_id() -> String {
    let mut buf = Uuid::new_v4().simple().to_string();
    buf.truncate(16);
    buf
}

/// Converts a UTC instant into the given IANA-style fixed offset, for the time-filter
/// branch only (§4.10 step 10); the engine otherwise keeps all timestamps as UTC.
pub fn to_offset(instant: DateTime<Utc>, offset_hours: i32) -> DateTime<chrono::FixedOffset> {
    let offset = chrono::FixedOffset::east_opt(offset_hours * 3600)
        .unwrap_or_else(|| chrono::FixedOffset::east_opt(0).unwrap());
    offset.from_utc_datetime(&instant.naive_utc())
}
