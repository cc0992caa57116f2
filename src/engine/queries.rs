use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability;
use super::{Engine, EngineError};

impl Engine {
    /// Bookable times for `staff_id` on `date`, judged against the engine clock.
    pub async fn compute_available_slots(
        &self,
        staff_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<SlotTime>, EngineError> {
        availability::compute_available_slots(
            self,
            staff_id,
            date,
            self.options.clock.now(),
            &self.options.availability,
        )
        .await
    }

    pub async fn list_tenants(&self) -> Vec<TenantInfo> {
        let tenants: Vec<_> = self.tenants.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(tenants.len());
        for tenant in tenants {
            let guard = tenant.read().await;
            out.push(TenantInfo {
                id: guard.id,
                name: guard.name.clone(),
                utc_offset_minutes: guard.utc_offset_minutes,
                grid: guard.grid_spec,
            });
        }
        out.sort_by_key(|t| t.id);
        out
    }

    pub async fn list_staff(&self, tenant_id: Option<Ulid>) -> Vec<StaffInfo> {
        let staff: Vec<_> = match tenant_id {
            Some(tid) => self
                .staff_of_tenant(&tid)
                .iter()
                .filter_map(|id| self.get_staff(id))
                .collect(),
            None => self.staff.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::with_capacity(staff.len());
        for schedule in staff {
            let guard = schedule.read().await;
            out.push(StaffInfo {
                id: guard.id,
                tenant_id: guard.tenant_id,
                name: guard.name.clone(),
                active: guard.active,
            });
        }
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn list_services(&self, tenant_id: Option<Ulid>) -> Vec<ServiceInfo> {
        let mut out: Vec<ServiceInfo> = self
            .services
            .iter()
            .filter(|e| tenant_id.is_none_or(|tid| e.value().tenant_id == tid))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// Configured rows only, ordered by weekday. Empty means unconfigured.
    pub async fn list_business_hours(
        &self,
        tenant_id: Ulid,
    ) -> Result<Vec<BusinessHours>, EngineError> {
        let tenant = self
            .get_tenant(&tenant_id)
            .ok_or(EngineError::NotFound(tenant_id))?;
        let guard = tenant.read().await;
        Ok(guard.hours.clone())
    }

    pub async fn bookings_for_staff(
        &self,
        staff_id: Ulid,
        date: Option<NaiveDate>,
    ) -> Vec<Booking> {
        let Some(staff) = self.get_staff(&staff_id) else {
            return vec![];
        };
        let guard = staff.read().await;
        match date {
            Some(d) => guard.on_date(d).to_vec(),
            None => guard.bookings.clone(),
        }
    }

    /// Every booking across the tenant's staff, ordered by date, time, staff.
    pub async fn bookings_for_tenant(
        &self,
        tenant_id: Ulid,
        date: Option<NaiveDate>,
    ) -> Vec<Booking> {
        let mut out = Vec::new();
        for staff_id in self.staff_of_tenant(&tenant_id) {
            out.extend(self.bookings_for_staff(staff_id, date).await);
        }
        out.sort_by_key(|b| (b.date, b.time, b.staff_id));
        out
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let staff_id = self.booking_to_staff.get(&id).map(|e| *e.value())?;
        let staff = self.get_staff(&staff_id)?;
        let guard = staff.read().await;
        guard.booking(id).cloned()
    }
}
