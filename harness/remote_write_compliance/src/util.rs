use std::fmt::Display;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ComplianceError;
use crate::Result;

/// Bit pattern Prometheus uses to mark a series as stale.
pub const STALE_NAN_BITS: u64 = 0x7ff0_0000_0000_0002;

/// Timestamps below this are most likely seconds, not milliseconds.
pub const MIN_MILLIS_TIMESTAMP: i64 = 1_000_000_000_000;

/// Timestamps above this are most likely micro- or nanoseconds.
pub const MAX_MILLIS_TIMESTAMP: i64 = 10_000_000_000_000_000;

/// Suffixes a classic histogram or summary spreads its series across.
pub const CLASSIC_SUFFIXES: [&str; 3] = ["_bucket", "_count", "_sum"];

/// A wrapper around `TryFrom`, returning `ComplianceError::FailedCast` on error.
pub fn cast_chk<T, U>(val: T, name: &str) -> Result<U>
where
    T: Copy + Display,
    U: std::convert::TryFrom<T>,
{
    U::try_from(val).map_err(|_| ComplianceError::failed_cast::<T, U>(val, name))
}

/// Wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> i64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    // CAST: milliseconds since epoch fit an i64 for the next 290 million years.
    elapsed.as_millis() as i64
}

/// True when `ts` is plausibly a millisecond timestamp.
#[inline]
pub fn is_millisecond_timestamp(ts: i64) -> bool {
    (MIN_MILLIS_TIMESTAMP..=MAX_MILLIS_TIMESTAMP).contains(&ts)
}

/// Any NaN may be a staleness marker. Senders are not required to keep the
/// exact bit pattern through conversion.
#[inline]
pub fn is_stale_marker(value: f64) -> bool {
    value.is_nan()
}

/// Strip a classic histogram/summary suffix from a metric name, if present.
pub fn strip_classic_suffix(name: &str) -> &str {
    CLASSIC_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .unwrap_or(name)
}

/// Metric family name for a series name: classic suffixes and `_total` removed.
pub fn family_name(name: &str) -> &str {
    let name = strip_classic_suffix(name);
    name.strip_suffix("_total").unwrap_or(name)
}
