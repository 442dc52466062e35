// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

pub mod error;
pub mod gate;
pub mod pool;
pub mod random;

use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonic milliseconds since an arbitrary epoch (process start on most platforms).
#[inline(always)]
pub fn ms_monotonic() -> i64 {
    lazy_static::lazy_static! {
        static ref START: std::time::Instant = std::time::Instant::now();
    }
    START.elapsed().as_millis() as i64
}

/// Milliseconds since the Unix epoch.
#[inline(always)]
pub fn ms_since_epoch() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as i64)
}
