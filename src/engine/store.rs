use async_trait::async_trait;
use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// What availability needs to know about a bookable staff member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffContext {
    pub tenant_id: Ulid,
    pub grid: SlotGrid,
    pub utc_offset_minutes: i32,
}

/// The lookups behind slot availability: staff → tenant resolution,
/// business hours by (tenant, weekday), and occupied times by (staff, date).
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// `Ok(None)` when the staff member or their tenant does not exist,
    /// or the staff member is not taking bookings.
    async fn resolve_staff(&self, staff_id: Ulid) -> Result<Option<StaffContext>, EngineError>;

    async fn business_hours(
        &self,
        tenant_id: Ulid,
        day_of_week: u8,
    ) -> Result<Option<BusinessHours>, EngineError>;

    /// Times held by non-cancelled bookings, ascending.
    async fn occupied_times(
        &self,
        staff_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<SlotTime>, EngineError>;
}

#[async_trait]
impl ScheduleStore for Engine {
    async fn resolve_staff(&self, staff_id: Ulid) -> Result<Option<StaffContext>, EngineError> {
        let Some(staff) = self.get_staff(&staff_id) else {
            return Ok(None);
        };
        let (tenant_id, active) = {
            let guard = staff.read().await;
            (guard.tenant_id, guard.active)
        };
        if !active {
            return Ok(None);
        }
        let Some(tenant) = self.get_tenant(&tenant_id) else {
            return Ok(None);
        };
        let guard = tenant.read().await;
        Ok(Some(StaffContext {
            tenant_id,
            grid: guard.grid.clone(),
            utc_offset_minutes: guard.utc_offset_minutes,
        }))
    }

    async fn business_hours(
        &self,
        tenant_id: Ulid,
        day_of_week: u8,
    ) -> Result<Option<BusinessHours>, EngineError> {
        let tenant = self
            .get_tenant(&tenant_id)
            .ok_or(EngineError::NotFound(tenant_id))?;
        let guard = tenant.read().await;
        Ok(guard.hours_for(day_of_week).cloned())
    }

    async fn occupied_times(
        &self,
        staff_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<SlotTime>, EngineError> {
        let staff = self
            .get_staff(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let guard = staff.read().await;
        Ok(guard.occupied_times(date))
    }
}
