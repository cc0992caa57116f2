use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::clock::now_ms;
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_candidate, validate_date};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    // ── Tenants ──────────────────────────────────────────────

    pub async fn create_tenant(
        &self,
        id: Ulid,
        name: Option<String>,
        utc_offset_minutes: i32,
        grid: GridSpec,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if self.tenants.len() >= MAX_TENANTS_PER_PARTITION {
            return Err(EngineError::LimitExceeded("too many tenants"));
        }
        if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("tenant name too long"));
        }
        if utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
            return Err(EngineError::Validation(format!(
                "utc offset out of range: {utc_offset_minutes}"
            )));
        }
        grid.validate()
            .map_err(|msg| EngineError::Validation(msg.into()))?;
        if self.tenants.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::TenantCreated {
            id,
            name: name.clone(),
            utc_offset_minutes,
            grid,
        };
        self.wal_append(&event).await?;
        self.tenants.insert(
            id,
            Arc::new(RwLock::new(TenantState::new(id, name, utc_offset_minutes, grid))),
        );
        tracing::info!(tenant_id = %id, "tenant created");
        Ok(())
    }

    /// Remove a tenant with its staff, services, hours and every booking.
    pub async fn delete_tenant(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let tenant = self.get_tenant(&id).ok_or(EngineError::NotFound(id))?;
        let _tenant_guard = tenant.write().await;
        if !self.tenants.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }

        let mut staff_ids = self.staff_of_tenant(&id);
        staff_ids.sort();
        let mut guards = Vec::with_capacity(staff_ids.len());
        for sid in &staff_ids {
            if let Some(staff) = self.get_staff(sid) {
                guards.push(staff.write_owned().await);
            }
        }

        self.wal_append(&Event::TenantDeleted { id }).await?;

        let mut purged = 0usize;
        for guard in &guards {
            for booking in &guard.bookings {
                self.booking_to_staff.remove(&booking.id);
            }
            purged += guard.bookings.len();
            self.staff.remove(&guard.id);
        }
        self.tenant_staff.remove(&id);
        self.services.retain(|_, s| s.tenant_id != id);
        self.tenants.remove(&id);
        tracing::info!(tenant_id = %id, staff = guards.len(), bookings = purged, "tenant deleted");
        Ok(())
    }

    /// Replace all of a tenant's business hours at once. An empty `hours`
    /// leaves the tenant unconfigured, so the weekday fallback applies again.
    pub async fn replace_business_hours(
        &self,
        tenant_id: Ulid,
        hours: Vec<BusinessHours>,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut seen = HashSet::new();
        let mut normalized = Vec::with_capacity(hours.len());
        for mut h in hours {
            if h.day_of_week > 6 {
                return Err(EngineError::Validation(format!(
                    "day_of_week must be 0..=6, got {}",
                    h.day_of_week
                )));
            }
            if !seen.insert(h.day_of_week) {
                return Err(EngineError::Validation(format!(
                    "duplicate hours for day_of_week {}",
                    h.day_of_week
                )));
            }
            if !h.is_open {
                h.open_time = None;
                h.close_time = None;
            }
            normalized.push(h);
        }

        let tenant = self
            .get_tenant(&tenant_id)
            .ok_or(EngineError::NotFound(tenant_id))?;
        let mut guard = tenant.write().await;
        let event = Event::BusinessHoursReplaced {
            tenant_id,
            hours: normalized,
        };
        self.wal_append(&event).await?;
        guard.apply(&event);
        Ok(())
    }

    // ── Staff ────────────────────────────────────────────────

    pub async fn add_staff(
        &self,
        id: Ulid,
        tenant_id: Ulid,
        name: Option<String>,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("staff name too long"));
        }
        let tenant = self
            .get_tenant(&tenant_id)
            .ok_or(EngineError::NotFound(tenant_id))?;
        // Held so the tenant cannot be deleted underneath us.
        let _tenant_guard = tenant.read().await;
        if !self.tenants.contains_key(&tenant_id) {
            return Err(EngineError::NotFound(tenant_id));
        }
        if self.staff.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.staff_of_tenant(&tenant_id).len() >= MAX_STAFF_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many staff members"));
        }

        let event = Event::StaffAdded {
            id,
            tenant_id,
            name: name.clone(),
        };
        self.wal_append(&event).await?;
        self.staff.insert(
            id,
            Arc::new(RwLock::new(StaffSchedule::new(id, tenant_id, name))),
        );
        self.tenant_staff.entry(tenant_id).or_default().push(id);
        Ok(())
    }

    pub async fn set_staff_active(&self, id: Ulid, active: bool) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let staff = self.get_staff(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = staff.write().await;
        if guard.active == active {
            return Ok(());
        }
        let event = Event::StaffActiveSet { id, active };
        self.wal_append(&event).await?;
        guard.apply(&event);
        Ok(())
    }

    /// Refused while any booking (of any status) references the staff member;
    /// deactivate instead.
    pub async fn remove_staff(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let staff = self.get_staff(&id).ok_or(EngineError::NotFound(id))?;
        let guard = staff.write().await;
        if !self.staff.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if !guard.bookings.is_empty() {
            return Err(EngineError::HasBookings(id));
        }
        self.wal_append(&Event::StaffRemoved { id }).await?;
        self.staff.remove(&id);
        if let Some(mut ids) = self.tenant_staff.get_mut(&guard.tenant_id) {
            ids.retain(|s| *s != id);
        }
        Ok(())
    }

    // ── Services ─────────────────────────────────────────────

    pub async fn add_service(
        &self,
        id: Ulid,
        tenant_id: Ulid,
        name: String,
        duration_minutes: u32,
        price_cents: i64,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if name.trim().is_empty() {
            return Err(EngineError::Validation("service name is required".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("service name too long"));
        }
        if duration_minutes == 0 || duration_minutes > 24 * 60 {
            return Err(EngineError::Validation(format!(
                "service duration out of range: {duration_minutes}"
            )));
        }
        if price_cents < 0 {
            return Err(EngineError::Validation("service price cannot be negative".into()));
        }
        let tenant = self
            .get_tenant(&tenant_id)
            .ok_or(EngineError::NotFound(tenant_id))?;
        let _tenant_guard = tenant.read().await;
        if !self.tenants.contains_key(&tenant_id) {
            return Err(EngineError::NotFound(tenant_id));
        }
        if self.services.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let count = self
            .services
            .iter()
            .filter(|s| s.value().tenant_id == tenant_id)
            .count();
        if count >= MAX_SERVICES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many services"));
        }

        let event = Event::ServiceAdded {
            id,
            tenant_id,
            name: name.clone(),
            duration_minutes,
            price_cents,
        };
        self.wal_append(&event).await?;
        self.services.insert(
            id,
            ServiceInfo {
                id,
                tenant_id,
                name,
                duration_minutes,
                price_cents,
            },
        );
        Ok(())
    }

    pub async fn remove_service(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if !self.services.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.wal_append(&Event::ServiceRemoved { id }).await?;
        self.services.remove(&id);
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Validate, re-check the slot, and persist a new confirmed booking.
    ///
    /// The collision check and the insert run under the staff member's write
    /// lock, so of two concurrent requests for the same (staff, date, time)
    /// exactly one succeeds and the other gets `Conflict`.
    pub async fn create_booking(&self, candidate: BookingCandidate) -> Result<Booking, EngineError> {
        let payment = validate_candidate(&candidate)?;

        let _gate = self.commit_gate.read().await;
        let staff_id = candidate.staff_id;
        if self.booking_to_staff.contains_key(&candidate.id) {
            return Err(EngineError::AlreadyExists(candidate.id));
        }
        let staff = self
            .get_staff(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let tenant_id = staff.read().await.tenant_id;
        let grid = {
            let tenant = self
                .get_tenant(&tenant_id)
                .ok_or(EngineError::NotFound(tenant_id))?;
            let guard = tenant.read().await;
            guard.grid.clone()
        };
        if !grid.contains(candidate.time) {
            return Err(EngineError::Validation(format!(
                "{} is not a bookable time",
                candidate.time
            )));
        }
        let service_tenant = self
            .services
            .get(&candidate.service_id)
            .map(|s| s.value().tenant_id)
            .ok_or(EngineError::NotFound(candidate.service_id))?;
        if service_tenant != tenant_id {
            return Err(EngineError::Validation(
                "service is not offered by this staff member's shop".into(),
            ));
        }

        let mut guard = staff.write().await;
        if !self.staff.contains_key(&staff_id) {
            return Err(EngineError::NotFound(staff_id));
        }
        if !guard.active {
            return Err(EngineError::Validation(
                "staff member is not taking bookings".into(),
            ));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_STAFF {
            return Err(EngineError::LimitExceeded("too many bookings for staff member"));
        }
        check_no_conflict(&guard, candidate.date, candidate.time)?;

        let booking = Booking {
            id: candidate.id,
            tenant_id,
            staff_id,
            service_id: candidate.service_id,
            date: candidate.date,
            time: candidate.time,
            status: BookingStatus::Confirmed,
            payment,
            client: candidate.client,
            notes: candidate.notes,
            created_at: now_ms(self.options.clock.as_ref()),
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.wal_append(&event).await?;
        guard.apply(&event);
        self.booking_to_staff.insert(booking.id, staff_id);
        tracing::info!(
            booking_id = %booking.id,
            %staff_id,
            date = %booking.date,
            time = %booking.time,
            "booking created"
        );
        Ok(booking)
    }

    /// Move a booking to `status`. Reviving a cancelled booking re-checks its
    /// slot, since it may have been taken in the meantime.
    pub async fn set_booking_status(
        &self,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (staff_id, mut guard) = self.resolve_booking_write(&id).await?;
        let current = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        if current.status == status {
            return Ok(current);
        }
        if !current.status.is_active() && status.is_active() {
            check_no_conflict(&guard, current.date, current.time)?;
        }

        let event = Event::BookingStatusChanged {
            id,
            staff_id,
            status,
        };
        self.wal_append(&event).await?;
        guard.apply(&event);
        tracing::debug!(booking_id = %id, from = current.status.as_str(), to = status.as_str(), "booking status changed");
        Ok(Booking { status, ..current })
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.set_booking_status(id, BookingStatus::Cancelled).await
    }

    /// Permanently delete a tenant's bookings dated strictly before `before`.
    /// Returns how many were removed.
    pub async fn clear_booking_history(
        &self,
        tenant_id: Ulid,
        before: NaiveDate,
    ) -> Result<usize, EngineError> {
        validate_date(before)?;
        let _gate = self.commit_gate.read().await;
        let tenant = self
            .get_tenant(&tenant_id)
            .ok_or(EngineError::NotFound(tenant_id))?;
        let _tenant_guard = tenant.read().await;

        let mut removed = 0usize;
        for staff_id in self.staff_of_tenant(&tenant_id) {
            let Some(staff) = self.get_staff(&staff_id) else {
                continue;
            };
            let mut guard = staff.write().await;
            let ids: Vec<Ulid> = guard
                .bookings
                .iter()
                .filter(|b| b.date < before)
                .map(|b| b.id)
                .collect();
            if ids.is_empty() {
                continue;
            }
            let event = Event::BookingsPurged { staff_id, ids };
            self.wal_append(&event).await?;
            guard.apply(&event);
            if let Event::BookingsPurged { ids, .. } = &event {
                for id in ids {
                    self.booking_to_staff.remove(id);
                }
                removed += ids.len();
            }
        }
        tracing::info!(%tenant_id, %before, removed, "booking history cleared");
        Ok(removed)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event sequence that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        let tenants: Vec<_> = self.tenants.iter().map(|e| e.value().clone()).collect();
        for tenant in tenants {
            let guard = tenant.read().await;
            events.push(Event::TenantCreated {
                id: guard.id,
                name: guard.name.clone(),
                utc_offset_minutes: guard.utc_offset_minutes,
                grid: guard.grid_spec,
            });
            if !guard.hours.is_empty() {
                events.push(Event::BusinessHoursReplaced {
                    tenant_id: guard.id,
                    hours: guard.hours.clone(),
                });
            }
        }

        for entry in self.services.iter() {
            let s = entry.value();
            events.push(Event::ServiceAdded {
                id: s.id,
                tenant_id: s.tenant_id,
                name: s.name.clone(),
                duration_minutes: s.duration_minutes,
                price_cents: s.price_cents,
            });
        }

        let staff: Vec<_> = self.staff.iter().map(|e| e.value().clone()).collect();
        for schedule in staff {
            let guard = schedule.read().await;
            events.push(Event::StaffAdded {
                id: guard.id,
                tenant_id: guard.tenant_id,
                name: guard.name.clone(),
            });
            if !guard.active {
                events.push(Event::StaffActiveSet {
                    id: guard.id,
                    active: false,
                });
            }
            for booking in &guard.bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::debug!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
