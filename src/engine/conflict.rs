use chrono::{Datelike, NaiveDate};

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Field-level checks on a submitted booking. Touches no stored state.
/// Returns the payment method, which is required.
pub(crate) fn validate_candidate(candidate: &BookingCandidate) -> Result<PaymentMethod, EngineError> {
    let client = &candidate.client;
    if client.name.trim().is_empty() {
        return Err(EngineError::Validation("client name is required".into()));
    }
    if client.phone.trim().is_empty() {
        return Err(EngineError::Validation("client phone is required".into()));
    }
    if client.name.len() > MAX_CONTACT_FIELD_LEN
        || client.phone.len() > MAX_CONTACT_FIELD_LEN
        || client.email.as_ref().is_some_and(|e| e.len() > MAX_CONTACT_FIELD_LEN)
    {
        return Err(EngineError::LimitExceeded("client contact field too long"));
    }
    if let Some(email) = &client.email
        && !email.trim().is_empty()
        && !email.contains('@')
    {
        return Err(EngineError::Validation(format!("malformed client email: {email}")));
    }
    if candidate.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    validate_date(candidate.date)?;
    candidate
        .payment
        .ok_or_else(|| EngineError::Validation("payment method is required".into()))
}

pub(crate) fn validate_date(date: NaiveDate) -> Result<(), EngineError> {
    if !(MIN_BOOKING_YEAR..=MAX_BOOKING_YEAR).contains(&date.year()) {
        return Err(EngineError::Validation(format!("date out of range: {date}")));
    }
    Ok(())
}

/// Refuse `(date, time)` if a non-cancelled booking already holds it.
/// Callers hold the schedule's write lock across this check and the insert.
pub(crate) fn check_no_conflict(
    schedule: &StaffSchedule,
    date: NaiveDate,
    time: SlotTime,
) -> Result<(), EngineError> {
    if let Some(existing) = schedule.active_at(date, time) {
        tracing::debug!(staff_id = %schedule.id, %date, %time, existing = %existing.id, "slot conflict");
        metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
        return Err(EngineError::Conflict(existing.id));
    }
    Ok(())
}
