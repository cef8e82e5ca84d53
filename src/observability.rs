use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "chairbook_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "chairbook_query_duration_seconds";

// ── Booking domain ──────────────────────────────────────────────

/// Counter: appointments confirmed.
pub const BOOKINGS_TOTAL: &str = "chairbook_bookings_total";

/// Counter: appointments cancelled. Labels: actor.
pub const CANCELLATIONS_TOTAL: &str = "chairbook_cancellations_total";

/// Counter: appointments moved to another slot.
pub const MODIFICATIONS_TOTAL: &str = "chairbook_modifications_total";

/// Counter: book/modify attempts refused because the slot was held.
pub const SLOT_CONFLICTS_TOTAL: &str = "chairbook_slot_conflicts_total";

/// Counter: waitlist entries promoted on a freed slot.
pub const WAITLIST_PROMOTIONS_TOTAL: &str = "chairbook_waitlist_promotions_total";

/// Gauge: freed slots whose promotion failed and awaits retry.
pub const PENDING_PROMOTIONS: &str = "chairbook_pending_promotions";

/// Counter: 24h reminders posted.
pub const REMINDERS_TOTAL: &str = "chairbook_reminders_total";

/// Counter: notices the dispatcher failed to deliver. Labels: notice.
pub const NOTIFY_FAILURES_TOTAL: &str = "chairbook_notify_failures_total";

/// Counter: availability cache lookups. Labels: result (hit/miss).
pub const CACHE_LOOKUPS_TOTAL: &str = "chairbook_cache_lookups_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "chairbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "chairbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "chairbook_connections_rejected_total";

/// Gauge: number of loaded shops.
pub const SHOPS_ACTIVE: &str = "chairbook_shops_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "chairbook_auth_failures_total";

/// Counter: ledger transactions committed.
pub const LEDGER_COMMITS_TOTAL: &str = "chairbook_ledger_commits_total";

/// Counter: optimistic transactions re-run after a read-set conflict.
pub const LEDGER_CONFLICTS_TOTAL: &str = "chairbook_ledger_conflicts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "chairbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "chairbook_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a statement.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::Book { .. } => "book",
        Command::Modify { .. } => "modify",
        Command::Complete { .. } => "complete",
        Command::Cancel { .. } => "cancel",
        Command::Enroll { .. } => "enroll",
        Command::Withdraw { .. } => "withdraw",
        Command::BlockDate { .. } => "block_date",
        Command::UnblockDate { .. } => "unblock_date",
        Command::UpsertService { .. } => "upsert_service",
        Command::RetireService { .. } => "retire_service",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectWaitlist => "select_waitlist",
        Command::SelectOccupancy { .. } => "select_occupancy",
        Command::SelectBlockedDates => "select_blocked_dates",
        Command::SelectServices => "select_services",
    }
}
