use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "chairtime_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "chairtime_query_duration_seconds";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: bookings refused because the slot was already held.
pub const BOOKING_CONFLICTS_TOTAL: &str = "chairtime_booking_conflicts_total";

/// Counter: availability answers served from the unfiltered grid (or empty)
/// after a store failure.
pub const AVAILABILITY_DEGRADED_TOTAL: &str = "chairtime_availability_degraded_total";

// ── Resource metrics ────────────────────────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "chairtime_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "chairtime_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "chairtime_connections_rejected_total";

/// Gauge: loaded partitions (one engine per database name).
pub const PARTITIONS_ACTIVE: &str = "chairtime_partitions_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "chairtime_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "chairtime_wal_flush_batch_size";

/// Counter: WAL compactions run.
pub const WAL_COMPACTIONS_TOTAL: &str = "chairtime_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertTenant { .. } => "insert_tenant",
        Command::DeleteTenant { .. } => "delete_tenant",
        Command::SelectTenants => "select_tenants",
        Command::InsertStaff { .. } => "insert_staff",
        Command::SetStaffActive { .. } => "set_staff_active",
        Command::DeleteStaff { .. } => "delete_staff",
        Command::SelectStaff { .. } => "select_staff",
        Command::InsertService { .. } => "insert_service",
        Command::DeleteService { .. } => "delete_service",
        Command::SelectServices { .. } => "select_services",
        Command::ReplaceBusinessHours { .. } => "replace_business_hours",
        Command::ClearBusinessHours { .. } => "clear_business_hours",
        Command::SelectBusinessHours { .. } => "select_business_hours",
        Command::InsertBooking(_) => "insert_booking",
        Command::SetBookingStatus { .. } => "set_booking_status",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::ClearBookingHistory { .. } => "clear_booking_history",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
