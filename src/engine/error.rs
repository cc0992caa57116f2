use ulid::Ulid;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// The slot is held by the contained non-cancelled booking.
    #[error("slot already booked by {0}")]
    Conflict(Ulid),
    #[error("invalid booking: {0}")]
    Validation(String),
    #[error("cannot remove staff member {0}: bookings still reference it")]
    HasBookings(Ulid),
    #[error("permission denied: {0}")]
    Forbidden(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("WAL error: {0}")]
    WalError(String),
}
