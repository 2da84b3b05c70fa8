use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── Requests ────────────────────────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "seatlock_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "seatlock_query_duration_seconds";

// ── Connections and tenants ─────────────────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "seatlock_connections_active";
pub const CONNECTIONS_TOTAL: &str = "seatlock_connections_total";
/// Counter: connections turned away at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "seatlock_connections_rejected_total";
pub const TENANTS_ACTIVE: &str = "seatlock_tenants_active";

// ── WAL ─────────────────────────────────────────────────────────

pub const WAL_FLUSH_DURATION_SECONDS: &str = "seatlock_wal_flush_duration_seconds";
/// Histogram: records per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "seatlock_wal_flush_batch_size";

// ── Seats ───────────────────────────────────────────────────────

pub const SEATS_HELD_TOTAL: &str = "seatlock_seats_held_total";
pub const SEATS_BOOKED_TOTAL: &str = "seatlock_seats_booked_total";
pub const SEATS_RELEASED_TOTAL: &str = "seatlock_seats_released_total";
/// Counter: HELD rows moved to RELEASED by reconciliation.
pub const HOLDS_EXPIRED_TOTAL: &str = "seatlock_holds_expired_total";
/// Counter: rejected hold/confirm batches. Labels: reason.
pub const CONFLICTS_TOTAL: &str = "seatlock_conflicts_total";
pub const LOCK_TIMEOUTS_TOTAL: &str = "seatlock_lock_timeouts_total";

/// Serve Prometheus metrics on `port`. Does nothing when no port is configured.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://{addr}/metrics");
    Ok(())
}

pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::ProvisionSeats { .. } => "provision_seats",
        Command::SelectTemplate => "select_template",
        Command::SelectSeatMap { .. } => "select_seat_map",
        Command::SelectSeatMapJson { .. } => "select_seat_map_json",
        Command::HoldSeats { .. } => "hold_seats",
        Command::ReleaseSeats { .. } => "release_seats",
        Command::ConfirmBooking { .. } => "confirm_booking",
        Command::SelectHolds { .. } => "select_holds",
        Command::SelectBooked { .. } => "select_booked",
        Command::SelectInventory { .. } => "select_inventory",
    }
}
