mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;
#[cfg(test)]
mod tests;

pub use availability::{AvailabilityPolicy, compute_available_slots, open_slots};
pub use error::EngineError;
pub use store::{ScheduleStore, StaffContext};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::wal::Wal;

pub type SharedTenantState = Arc<RwLock<TenantState>>;
pub type SharedStaffSchedule = Arc<RwLock<StaffSchedule>>;

type Reply<T> = oneshot::Sender<T>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: Reply<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: Reply<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: Reply<u64>,
    },
}

/// Owns the WAL. Appends that arrive while a batch is being gathered share a
/// single fsync; control commands first commit whatever is pending.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut pending: Vec<(Event, Reply<io::Result<()>>)> = Vec::new();
    while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        while let Some(cmd) = next.take() {
            match cmd {
                WalCommand::Append { event, response } => pending.push((event, response)),
                WalCommand::Compact { events, response } => {
                    commit_batch(&mut wal, &mut pending);
                    let _ = response.send(wal.compact(&events));
                }
                WalCommand::AppendsSinceCompact { response } => {
                    commit_batch(&mut wal, &mut pending);
                    let _ = response.send(wal.appends_since_compact());
                }
            }
            next = rx.try_recv().ok();
        }
        commit_batch(&mut wal, &mut pending);
    }
}

fn commit_batch(wal: &mut Wal, pending: &mut Vec<(Event, Reply<io::Result<()>>)>) {
    if pending.is_empty() {
        return;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(pending.len() as f64);
    let started = std::time::Instant::now();

    let outcome = pending
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    // A failed batch must not leave partial records for the next one to land
    // behind; every sender in it is told it failed.
    if let Err(e) = &outcome {
        tracing::error!(error = %e, batch = pending.len(), "WAL batch failed, rolling back");
        if let Err(rollback) = wal.discard_unsynced() {
            tracing::error!(error = %rollback, "WAL rollback failed");
        }
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in pending.drain(..) {
        let reply = match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

// ── Engine ───────────────────────────────────────────────

#[derive(Clone)]
pub struct EngineOptions {
    pub availability: AvailabilityPolicy,
    pub clock: Arc<dyn Clock>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            availability: AvailabilityPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

/// All tenants, staff, services, hours and bookings of one partition.
pub struct Engine {
    tenants: DashMap<Ulid, SharedTenantState>,
    staff: DashMap<Ulid, SharedStaffSchedule>,
    services: DashMap<Ulid, ServiceInfo>,
    /// tenant id → staff ids
    tenant_staff: DashMap<Ulid, Vec<Ulid>>,
    /// booking id → staff id
    booking_to_staff: DashMap<Ulid, Ulid>,
    /// Mutations hold this shared; compaction holds it exclusively so the
    /// snapshot it writes cannot miss an in-flight append.
    commit_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    options: EngineOptions,
}

/// Plain state rebuilt from the log before any locks exist.
#[derive(Default)]
struct ReplayState {
    tenants: HashMap<Ulid, TenantState>,
    staff: HashMap<Ulid, StaffSchedule>,
    services: HashMap<Ulid, ServiceInfo>,
}

impl ReplayState {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::TenantCreated {
                id,
                name,
                utc_offset_minutes,
                grid,
            } => {
                self.tenants
                    .insert(*id, TenantState::new(*id, name.clone(), *utc_offset_minutes, *grid));
            }
            Event::TenantDeleted { id } => {
                self.tenants.remove(id);
                self.staff.retain(|_, s| s.tenant_id != *id);
                self.services.retain(|_, s| s.tenant_id != *id);
            }
            Event::BusinessHoursReplaced { tenant_id, .. } => {
                if let Some(tenant) = self.tenants.get_mut(tenant_id) {
                    tenant.apply(event);
                }
            }
            Event::StaffAdded { id, tenant_id, name } => {
                if self.tenants.contains_key(tenant_id) {
                    self.staff
                        .insert(*id, StaffSchedule::new(*id, *tenant_id, name.clone()));
                }
            }
            Event::StaffRemoved { id } => {
                self.staff.remove(id);
            }
            Event::ServiceAdded {
                id,
                tenant_id,
                name,
                duration_minutes,
                price_cents,
            } => {
                if self.tenants.contains_key(tenant_id) {
                    self.services.insert(
                        *id,
                        ServiceInfo {
                            id: *id,
                            tenant_id: *tenant_id,
                            name: name.clone(),
                            duration_minutes: *duration_minutes,
                            price_cents: *price_cents,
                        },
                    );
                }
            }
            Event::ServiceRemoved { id } => {
                self.services.remove(id);
            }
            Event::StaffActiveSet { .. }
            | Event::BookingCreated { .. }
            | Event::BookingStatusChanged { .. }
            | Event::BookingsPurged { .. } => {
                if let Some(staff_id) = event_staff_id(event)
                    && let Some(staff) = self.staff.get_mut(&staff_id)
                {
                    staff.apply(event);
                }
            }
        }
    }
}

/// The staff member a per-schedule event applies to.
fn event_staff_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::StaffActiveSet { id, .. } => Some(*id),
        Event::BookingCreated { booking } => Some(booking.staff_id),
        Event::BookingStatusChanged { staff_id, .. } | Event::BookingsPurged { staff_id, .. } => {
            Some(*staff_id)
        }
        _ => None,
    }
}

impl Engine {
    /// Replay the log at `wal_path`, cutting off any unreadable tail, and
    /// start the WAL writer task.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf, options: EngineOptions) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut replay = ReplayState::default();
        for event in &events {
            replay.apply(event);
        }

        let engine = Self {
            tenants: DashMap::new(),
            staff: DashMap::new(),
            services: DashMap::new(),
            tenant_staff: DashMap::new(),
            booking_to_staff: DashMap::new(),
            commit_gate: RwLock::new(()),
            wal_tx,
            options,
        };
        for (id, tenant) in replay.tenants {
            engine.tenants.insert(id, Arc::new(RwLock::new(tenant)));
        }
        for (id, service) in replay.services {
            engine.services.insert(id, service);
        }
        for (id, schedule) in replay.staff {
            engine.tenant_staff.entry(schedule.tenant_id).or_default().push(id);
            for booking in &schedule.bookings {
                engine.booking_to_staff.insert(booking.id, id);
            }
            engine.staff.insert(id, Arc::new(RwLock::new(schedule)));
        }
        if !events.is_empty() {
            tracing::debug!(
                events = events.len(),
                tenants = engine.tenants.len(),
                staff = engine.staff.len(),
                "replayed WAL"
            );
        }
        Ok(engine)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_tenant(&self, id: &Ulid) -> Option<SharedTenantState> {
        self.tenants.get(id).map(|e| e.value().clone())
    }

    pub fn get_staff(&self, id: &Ulid) -> Option<SharedStaffSchedule> {
        self.staff.get(id).map(|e| e.value().clone())
    }

    pub fn staff_of_tenant(&self, tenant_id: &Ulid) -> Vec<Ulid> {
        self.tenant_staff
            .get(tenant_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Lookup booking → staff, then take that staff member's write lock.
    async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<StaffSchedule>), EngineError> {
        let staff_id = self
            .booking_to_staff
            .get(booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*booking_id))?;
        let staff = self
            .get_staff(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        Ok((staff_id, staff.write_owned().await))
    }
}
