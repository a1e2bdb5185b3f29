use std::net::SocketAddr;

use crate::sql::Command;

// ── Writes ──────────────────────────────────────────────────────

/// Counter: transactions committed or aborted. Labels: outcome.
pub const COMMITS_TOTAL: &str = "tempora_commits_total";

/// Counter: optimistic conflicts. Labels: kind (stale_version, target_gone).
pub const CONFLICTS_TOTAL: &str = "tempora_conflicts_total";

// ── Reads ───────────────────────────────────────────────────────

/// Counter: wire statements executed. Labels: command, status.
pub const STATEMENTS_TOTAL: &str = "tempora_statements_total";

/// Histogram: event query resolution time in seconds.
pub const QUERY_DURATION_SECONDS: &str = "tempora_query_duration_seconds";

/// Counter: synchronous waits that gave up before the query settled.
pub const QUERY_TIMEOUTS_TOTAL: &str = "tempora_query_timeouts_total";

// ── Connections ─────────────────────────────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "tempora_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tempora_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tempora_connections_rejected_total";

// ── Durability ──────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tempora_wal_flush_duration_seconds";

/// Histogram: transactions per WAL flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "tempora_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const COMPACTIONS_TOTAL: &str = "tempora_compactions_total";

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

/// Short metrics label for a parsed statement.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::Insert { table, .. } => match table {
            crate::sql::Table::Resources => "insert_resource",
            crate::sql::Table::Reservations => "insert_reservation",
            crate::sql::Table::Appointments => "insert_appointment",
        },
        Command::Update { .. } => "update",
        Command::Delete { .. } => "delete",
        Command::SelectEvents { .. } => "select_events",
        Command::SelectTable { .. } => "select_table",
    }
}
