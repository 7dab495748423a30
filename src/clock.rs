//! Monotonic audit clock.

use parking_lot::Mutex;
use time::{Duration, OffsetDateTime};

/// Issues audit timestamps that strictly increase across calls, even when
/// two saves land within the same wall-clock tick or the wall clock steps back.
#[derive(Debug)]
pub struct AuditClock {
    last: Mutex<OffsetDateTime>,
}

impl AuditClock {
    /// Creates a clock. The first tick returns the current wall time.
    pub fn new() -> Self {
        Self {
            last: Mutex::new(OffsetDateTime::UNIX_EPOCH),
        }
    }

    /// Returns the next stamp.
    pub fn tick(&self) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        let mut last = self.last.lock();
        let next = if now > *last {
            now
        } else {
            *last + Duration::microseconds(1)
        };
        *last = next;
        next
    }
}

impl Default for AuditClock {
    fn default() -> Self {
        Self::new()
    }
}
