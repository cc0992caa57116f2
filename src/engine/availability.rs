use chrono::{DateTime, NaiveDate, Utc};
use ulid::Ulid;

use crate::clock::tenant_local_now;
use crate::model::*;

use super::store::ScheduleStore;
use super::EngineError;

// ── Availability Algorithm ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityPolicy {
    /// On a store failure, offer the whole grid instead of returning the error.
    pub fail_open: bool,
    /// Weekday (0 = Sunday) treated as closed when a tenant has no hours for it.
    pub fallback_closed_weekday: u8,
}

impl Default for AvailabilityPolicy {
    fn default() -> Self {
        Self {
            fail_open: true,
            fallback_closed_weekday: 1,
        }
    }
}

/// Filter a grid down to bookable slots, keeping grid order.
///
/// A slot survives when it is not held by an active booking, falls inside the
/// day's hours, and (when `now` is given) is strictly later than `now`.
pub fn open_slots(
    grid: &SlotGrid,
    hours: DayHours,
    occupied: &[SlotTime],
    now: Option<SlotTime>,
) -> Vec<SlotTime> {
    if hours == DayHours::Closed {
        return Vec::new();
    }
    grid.times()
        .iter()
        .copied()
        .filter(|t| !occupied.contains(t))
        .filter(|t| hours.admits(*t))
        .filter(|t| now.is_none_or(|n| *t > n))
        .collect()
}

/// Bookable slots for one staff member on one date.
///
/// An unknown or inactive staff member yields no slots. A failed hours or
/// bookings lookup yields the tenant's full, unfiltered grid while
/// `policy.fail_open` is set, and the error otherwise.
pub async fn compute_available_slots<S: ScheduleStore + ?Sized>(
    store: &S,
    staff_id: Ulid,
    date: NaiveDate,
    now: DateTime<Utc>,
    policy: &AvailabilityPolicy,
) -> Result<Vec<SlotTime>, EngineError> {
    let ctx = match store.resolve_staff(staff_id).await {
        Ok(Some(ctx)) => ctx,
        Ok(None) => return Ok(Vec::new()),
        Err(e) if policy.fail_open => {
            tracing::warn!(%staff_id, %date, "staff lookup failed, offering no slots: {e}");
            metrics::counter!(crate::observability::AVAILABILITY_DEGRADED_TOTAL).increment(1);
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    let weekday = day_of_week(date);
    let configured = match store.business_hours(ctx.tenant_id, weekday).await {
        Ok(h) => h,
        Err(e) => return degrade(&ctx.grid, staff_id, date, e, policy),
    };
    let hours = DayHours::resolve(configured.as_ref(), weekday, policy.fallback_closed_weekday);
    if hours == DayHours::Closed {
        return Ok(Vec::new());
    }

    let occupied = match store.occupied_times(staff_id, date).await {
        Ok(times) => times,
        Err(e) => return degrade(&ctx.grid, staff_id, date, e, policy),
    };

    let (today, now_time) = tenant_local_now(now, ctx.utc_offset_minutes);
    let cutoff = (date == today).then_some(now_time);
    Ok(open_slots(&ctx.grid, hours, &occupied, cutoff))
}

fn degrade(
    grid: &SlotGrid,
    staff_id: Ulid,
    date: NaiveDate,
    err: EngineError,
    policy: &AvailabilityPolicy,
) -> Result<Vec<SlotTime>, EngineError> {
    if !policy.fail_open {
        return Err(err);
    }
    tracing::warn!(%staff_id, %date, "availability lookup failed, serving full grid: {err}");
    metrics::counter!(crate::observability::AVAILABILITY_DEGRADED_TOTAL).increment(1);
    Ok(grid.times().to_vec())
}
