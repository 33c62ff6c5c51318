use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotledger_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotledger_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotledger_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotledger_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotledger_connections_rejected_total";

/// Gauge: number of open venues (loaded engines).
pub const VENUES_ACTIVE: &str = "slotledger_venues_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "slotledger_auth_failures_total";

/// Counter: commands refused for the connected role. Labels: command.
pub const PERMISSION_DENIED_TOTAL: &str = "slotledger_permission_denied_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotledger_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotledger_wal_flush_batch_size";

// ── Domain ──────────────────────────────────────────────────────

/// Counter: overlapping writes seen. Labels: channel, policy.
pub const CONFLICTS_TOTAL: &str = "slotledger_conflicts_total";

/// Counter: award attempts by result. Labels: outcome.
pub const AWARDS_TOTAL: &str = "slotledger_awards_total";

/// Counter: manual balance adjustments. Labels: direction.
pub const ADJUSTMENTS_TOTAL: &str = "slotledger_adjustments_total";

/// Counter: legacy records left out of an import.
pub const MIGRATION_SKIPPED_TOTAL: &str = "slotledger_migration_skipped_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource { .. } => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservationStatus { .. } => "update_reservation_status",
        Command::InsertCounterBooking(_) => "insert_counter_booking",
        Command::UpdateCounterTimes { .. } => "update_counter_times",
        Command::UpdateCounterPayment { .. } => "update_counter_payment",
        Command::CloseCounterSession { .. } => "close_counter_session",
        Command::DeleteCounterBooking { .. } => "delete_counter_booking",
        Command::ImportLegacy { .. } => "import_legacy",
        Command::InsertAdjustment { .. } => "insert_adjustment",
        Command::SelectResources => "select_resources",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectCounterBookings { .. } => "select_counter_bookings",
        Command::SelectCustomer { .. } => "select_customer",
        Command::SelectAccount { .. } => "select_account",
        Command::SelectAudit { .. } => "select_audit",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
