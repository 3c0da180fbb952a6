use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "velocita_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "velocita_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: reservations accepted.
pub const RESERVATIONS_CREATED_TOTAL: &str = "velocita_reservations_created_total";

/// Counter: requests refused because the dates were taken.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "velocita_reservation_conflicts_total";

/// Counter: lifecycle transitions. Labels: to.
pub const RESERVATION_TRANSITIONS_TOTAL: &str = "velocita_reservation_transitions_total";

/// Counter: pending reservations cancelled by the reaper.
pub const RESERVATIONS_EXPIRED_TOTAL: &str = "velocita_reservations_expired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "velocita_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "velocita_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "velocita_connections_rejected_total";

/// Gauge: storefronts with a loaded engine.
pub const STOREFRONTS_ACTIVE: &str = "velocita_storefronts_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "velocita_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "velocita_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertVehicle { .. } => "insert_vehicle",
        Command::DeleteVehicle { .. } => "delete_vehicle",
        Command::InsertAddOn { .. } => "insert_add_on",
        Command::DeleteAddOn { .. } => "delete_add_on",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::InsertHistory { .. } => "insert_history",
        Command::SelectVehicles { .. } => "select_vehicles",
        Command::SelectAddOns => "select_add_ons",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectHistory { .. } => "select_history",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectQuote { .. } => "select_quote",
    }
}
