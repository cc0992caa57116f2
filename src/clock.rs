use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};

use crate::model::SlotTime;

/// Source of "now". Swapped for a fixed instant in tests.
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

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Calendar date and time of day at `now` for a tenant `utc_offset_minutes` from UTC.
pub fn tenant_local_now(now: DateTime<Utc>, utc_offset_minutes: i32) -> (NaiveDate, SlotTime) {
    let local = match FixedOffset::east_opt(utc_offset_minutes * 60) {
        Some(offset) => now.with_timezone(&offset).naive_local(),
        None => now.naive_utc() + Duration::minutes(utc_offset_minutes as i64),
    };
    (local.date(), SlotTime::from_naive_time(local.time()))
}

pub fn now_ms(clock: &dyn Clock) -> i64 {
    clock.now().timestamp_millis()
}
