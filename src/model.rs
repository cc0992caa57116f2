use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for record timestamps only.
pub type Ms = i64;

// ── Time of day ──────────────────────────────────────────────────

/// A zero-padded `HH:MM` time of day, stored as minutes since midnight.
///
/// Ordering matches the lexical ordering of the `HH:MM` text form, so range
/// and "later than now" checks behave exactly like string comparisons would.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotTime(u16);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid time of day {0:?}, expected HH:MM")]
pub struct InvalidSlotTime(pub String);

impl SlotTime {
    pub const fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self(hour * 60 + minute))
        } else {
            None
        }
    }

    /// Truncates seconds: 10:30:59 becomes 10:30.
    pub fn from_naive_time(t: NaiveTime) -> Self {
        Self((t.hour() * 60 + t.minute()) as u16)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    pub fn hour(self) -> u16 {
        self.0 / 60
    }

    pub fn minute(self) -> u16 {
        self.0 % 60
    }

    pub fn checked_add_minutes(self, minutes: u16) -> Option<Self> {
        let total = self.0.checked_add(minutes)?;
        (total < 24 * 60).then_some(Self(total))
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for SlotTime {
    type Err = InvalidSlotTime;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || InvalidSlotTime(s.to_string());
        let b = s.as_bytes();
        if b.len() != 5 || b[2] != b':' {
            return Err(bad());
        }
        let digits = [b[0], b[1], b[3], b[4]];
        if !digits.iter().all(u8::is_ascii_digit) {
            return Err(bad());
        }
        let d = |c: u8| (c - b'0') as u16;
        let hour = d(b[0]) * 10 + d(b[1]);
        let minute = d(b[3]) * 10 + d(b[4]);
        Self::from_hm(hour, minute).ok_or_else(bad)
    }
}

/// Day of week with 0 = Sunday .. 6 = Saturday.
///
/// A `NaiveDate` carries no zone, so this is the weekday of the calendar date
/// itself; no midnight-in-UTC shift can move it to the previous day.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

// ── Slot grid ────────────────────────────────────────────────────

/// Parameters of a tenant's canonical slot grid: every `step_minutes` from
/// `start` up to and including `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSpec {
    pub start: SlotTime,
    pub end: SlotTime,
    pub step_minutes: u16,
}

impl Default for GridSpec {
    /// 09:00, 09:45, ... 18:45.
    fn default() -> Self {
        Self {
            start: SlotTime(9 * 60),
            end: SlotTime(18 * 60 + 45),
            step_minutes: 45,
        }
    }
}

impl GridSpec {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.step_minutes == 0 {
            return Err("grid step must be positive");
        }
        if self.start > self.end {
            return Err("grid start must not be after grid end");
        }
        let count = (self.end.minutes() - self.start.minutes()) / self.step_minutes + 1;
        if count as usize > crate::limits::MAX_GRID_SLOTS {
            return Err("grid has too many slots");
        }
        Ok(())
    }

    pub fn slots(&self) -> SlotGrid {
        let mut times = Vec::new();
        let mut cur = Some(self.start);
        while let Some(t) = cur {
            if t > self.end {
                break;
            }
            times.push(t);
            cur = t.checked_add_minutes(self.step_minutes.max(1));
        }
        SlotGrid { times }
    }
}

/// The ordered set of times of day eligible for booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotGrid {
    times: Vec<SlotTime>,
}

impl Default for SlotGrid {
    fn default() -> Self {
        GridSpec::default().slots()
    }
}

impl SlotGrid {
    pub fn times(&self) -> &[SlotTime] {
        &self.times
    }

    pub fn contains(&self, t: SlotTime) -> bool {
        self.times.binary_search(&t).is_ok()
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

// ── Business hours ───────────────────────────────────────────────

/// Configured hours for one (tenant, day-of-week).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    pub day_of_week: u8,
    pub is_open: bool,
    pub open_time: Option<SlotTime>,
    pub close_time: Option<SlotTime>,
}

/// What a given day's hours allow, after applying the unconfigured fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayHours {
    Closed,
    /// Open with no explicit window: the whole grid is eligible.
    FullGrid,
    /// Inclusive on both ends.
    Window { open: SlotTime, close: SlotTime },
}

impl DayHours {
    /// Unconfigured days are open with the full grid, except
    /// `fallback_closed_weekday` which is closed.
    pub fn resolve(
        configured: Option<&BusinessHours>,
        day_of_week: u8,
        fallback_closed_weekday: u8,
    ) -> Self {
        match configured {
            None if day_of_week == fallback_closed_weekday => DayHours::Closed,
            None => DayHours::FullGrid,
            Some(h) if !h.is_open => DayHours::Closed,
            Some(h) => match (h.open_time, h.close_time) {
                (Some(open), Some(close)) => DayHours::Window { open, close },
                _ => DayHours::FullGrid,
            },
        }
    }

    pub fn admits(&self, t: SlotTime) -> bool {
        match self {
            DayHours::Closed => false,
            DayHours::FullGrid => true,
            DayHours::Window { open, close } => *open <= t && t <= *close,
        }
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    NoShow,
    Cancelled,
}

impl BookingStatus {
    /// Every status except `Cancelled` occupies its slot.
    pub fn is_active(self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::NoShow => "no_show",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "completed" => Ok(BookingStatus::Completed),
            "no_show" => Ok(BookingStatus::NoShow),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

/// How the booking is (or will be) paid. Chosen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    Free,
    PendingCash,
    PaidOnline,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Free => "free",
            PaymentMethod::PendingCash => "pending_cash",
            PaymentMethod::PaidOnline => "paid_online",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(PaymentMethod::Free),
            "pending_cash" => Ok(PaymentMethod::PendingCash),
            "paid_online" => Ok(PaymentMethod::PaidOnline),
            other => Err(format!("unknown payment method: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientContact {
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub time: SlotTime,
    pub status: BookingStatus,
    pub payment: PaymentMethod,
    pub client: ClientContact,
    pub notes: Option<String>,
    pub created_at: Ms,
}

/// A booking as submitted by a client, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingCandidate {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub time: SlotTime,
    pub client: ClientContact,
    pub payment: Option<PaymentMethod>,
    pub notes: Option<String>,
}

// ── Per-entity state ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TenantState {
    pub id: Ulid,
    pub name: Option<String>,
    pub utc_offset_minutes: i32,
    pub grid_spec: GridSpec,
    pub grid: SlotGrid,
    /// At most one row per weekday, sorted by `day_of_week`.
    pub hours: Vec<BusinessHours>,
}

impl TenantState {
    pub fn new(id: Ulid, name: Option<String>, utc_offset_minutes: i32, grid_spec: GridSpec) -> Self {
        Self {
            id,
            name,
            utc_offset_minutes,
            grid_spec,
            grid: grid_spec.slots(),
            hours: Vec::new(),
        }
    }

    pub fn hours_for(&self, day_of_week: u8) -> Option<&BusinessHours> {
        self.hours.iter().find(|h| h.day_of_week == day_of_week)
    }

    pub fn apply(&mut self, event: &Event) {
        if let Event::BusinessHoursReplaced { hours, .. } = event {
            let mut hours = hours.clone();
            hours.sort_by_key(|h| h.day_of_week);
            self.hours = hours;
        }
    }
}

/// A staff member and every booking made against them.
#[derive(Debug, Clone)]
pub struct StaffSchedule {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub name: Option<String>,
    pub active: bool,
    /// Sorted by `(date, time)`; insertion order is kept among equal keys.
    pub bookings: Vec<Booking>,
}

impl StaffSchedule {
    pub fn new(id: Ulid, tenant_id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            tenant_id,
            name,
            active: true,
            bookings: Vec::new(),
        }
    }

    pub fn insert_booking(&mut self, booking: Booking) {
        let key = (booking.date, booking.time);
        let pos = self.bookings.partition_point(|b| (b.date, b.time) <= key);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// All bookings (any status) on one date, in time order.
    pub fn on_date(&self, date: NaiveDate) -> &[Booking] {
        let lo = self.bookings.partition_point(|b| b.date < date);
        let hi = self.bookings.partition_point(|b| b.date <= date);
        &self.bookings[lo..hi]
    }

    /// The non-cancelled booking holding `(date, time)`, if any.
    pub fn active_at(&self, date: NaiveDate, time: SlotTime) -> Option<&Booking> {
        self.on_date(date)
            .iter()
            .find(|b| b.time == time && b.status.is_active())
    }

    pub fn occupied_times(&self, date: NaiveDate) -> Vec<SlotTime> {
        self.on_date(date)
            .iter()
            .filter(|b| b.status.is_active())
            .map(|b| b.time)
            .collect()
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::BookingCreated { booking } => self.insert_booking(booking.clone()),
            Event::BookingStatusChanged { id, status, .. } => {
                if let Some(b) = self.bookings.iter_mut().find(|b| b.id == *id) {
                    b.status = *status;
                }
            }
            Event::BookingsPurged { ids, .. } => {
                self.bookings.retain(|b| !ids.contains(&b.id));
            }
            Event::StaffActiveSet { active, .. } => self.active = *active,
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    pub price_cents: i64,
}

/// The WAL record format. One event per committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TenantCreated {
        id: Ulid,
        name: Option<String>,
        utc_offset_minutes: i32,
        grid: GridSpec,
    },
    TenantDeleted {
        id: Ulid,
    },
    BusinessHoursReplaced {
        tenant_id: Ulid,
        hours: Vec<BusinessHours>,
    },
    StaffAdded {
        id: Ulid,
        tenant_id: Ulid,
        name: Option<String>,
    },
    StaffActiveSet {
        id: Ulid,
        active: bool,
    },
    StaffRemoved {
        id: Ulid,
    },
    ServiceAdded {
        id: Ulid,
        tenant_id: Ulid,
        name: String,
        duration_minutes: u32,
        price_cents: i64,
    },
    ServiceRemoved {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        staff_id: Ulid,
        status: BookingStatus,
    },
    BookingsPurged {
        staff_id: Ulid,
        ids: Vec<Ulid>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub utc_offset_minutes: i32,
    pub grid: GridSpec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffInfo {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub name: Option<String>,
    pub active: bool,
}
