use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "freeslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "freeslot_query_duration_seconds";

// ── Scheduling outcomes ─────────────────────────────────────────

/// Counter: booking attempts that reached the day lock. Labels: outcome (booked, no_slot).
pub const BOOKINGS_TOTAL: &str = "freeslot_bookings_total";

/// Counter: committed transactions. Labels: kind (save_day, book, cancel).
pub const COMMITS_TOTAL: &str = "freeslot_commits_total";

/// Counter: committed cancellations.
pub const CANCELLATIONS_TOTAL: &str = "freeslot_cancellations_total";

/// Counter: free intervals absorbed into restored ranges by cancellations.
pub const INTERVALS_MERGED_TOTAL: &str = "freeslot_intervals_merged_total";

/// Counter: existing appointments overlapped by newly saved availability.
pub const SAVE_DAY_ORPHANS_TOTAL: &str = "freeslot_save_day_orphans_total";

/// Counter: transactions abandoned because the day lock was not acquired in time.
pub const LOCK_TIMEOUTS_TOTAL: &str = "freeslot_lock_timeouts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "freeslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "freeslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "freeslot_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "freeslot_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "freeslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "freeslot_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
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
        Command::InsertService { .. } => "insert_service",
        Command::SelectServices { .. } => "select_services",
        Command::SaveSchedule { ranges, .. } if ranges.is_empty() => "clear_schedule",
        Command::SaveSchedule { .. } => "save_schedule",
        Command::SelectSchedule { days: None, .. } => "select_day",
        Command::SelectSchedule { .. } => "select_range",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::DeleteAppointment { .. } => "delete_appointment",
    }
}
