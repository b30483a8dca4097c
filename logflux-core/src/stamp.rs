//! Message timestamps: seconds, microseconds and the zone offset the
//! message was stamped with.

use chrono::{Local, Offset, TimeZone};
use std::time::{SystemTime, UNIX_EPOCH};

pub const TS_STAMP: usize = 0;
pub const TS_RECVD: usize = 1;
pub const TS_MAX: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub sec: i64,
    pub usec: u32,
    /// Offset from UTC in seconds at the time of stamping.
    pub zone_offset: i32,
}

impl Stamp {
    /// The unset sentinel used for a not-yet-parsed STAMP slot.
    pub const UNSET: Stamp = Stamp {
        sec: -1,
        usec: 0,
        zone_offset: -1,
    };

    pub fn now() -> Stamp {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let sec = elapsed.as_secs() as i64;
        Stamp {
            sec,
            usec: elapsed.subsec_micros(),
            zone_offset: local_zone_offset(sec),
        }
    }

    pub fn is_set(&self) -> bool {
        self.sec != -1
    }
}

/// Offset of the local timezone from UTC, in seconds, at `sec`.
pub fn local_zone_offset(sec: i64) -> i32 {
    match Local.timestamp_opt(sec, 0) {
        chrono::LocalResult::Single(t) => t.offset().fix().local_minus_utc(),
        _ => 0,
    }
}
