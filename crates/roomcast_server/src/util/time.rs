#![forbid(unsafe_code)]

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	Utc::now().timestamp_millis()
}

/// `at + d`, saturating at the far future instead of overflowing.
pub fn add_duration(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
	chrono::Duration::from_std(d)
		.ok()
		.and_then(|d| at.checked_add_signed(d))
		.unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn hours(n: u32) -> Duration {
	Duration::from_secs(u64::from(n) * 3600)
}
