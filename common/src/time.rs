// Wall-clock timestamp helpers.
//
// Everything here reads SystemTime::now() and is therefore
// non-deterministic: fine for appeal windows, scanner scheduling and
// logging, never an input to a consensus outcome.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Distinct aliases so signatures say which unit they carry
pub type TimestampMillis = u64;
pub type TimestampSeconds = u64;

#[inline]
pub fn get_current_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the unix epoch")
}

pub fn get_current_time_in_seconds() -> TimestampSeconds {
    get_current_time().as_secs()
}

// u64 millis overflow is many millennia away
pub fn get_current_time_in_millis() -> TimestampMillis {
    get_current_time().as_millis() as TimestampMillis
}
