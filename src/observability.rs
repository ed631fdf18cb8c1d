use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "washbay_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "washbay_request_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: bookings committed. Labels: override ("true"/"false").
pub const BOOKINGS_CREATED_TOTAL: &str = "washbay_bookings_created_total";

/// Counter: booking mutations rejected before commit. Labels: reason (error kind).
pub const BOOKING_REJECTIONS_TOTAL: &str = "washbay_booking_rejections_total";

/// Counter: creation attempts refused by the rate limiter.
pub const RATE_LIMITED_TOTAL: &str = "washbay_rate_limited_total";

/// Counter: notices that could not be queued or delivered.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "washbay_notifications_failed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "washbay_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "washbay_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "washbay_connections_rejected_total";

/// Counter: failed admin authentication attempts.
pub const AUTH_FAILURES_TOTAL: &str = "washbay_auth_failures_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "washbay_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "washbay_journal_flush_batch_size";

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

/// Map a request variant to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Authenticate { .. } => "authenticate",
        Request::AvailableSlots { .. } => "available_slots",
        Request::CreateBooking(_) => "create_booking",
        Request::RescheduleBooking(_) => "reschedule_booking",
        Request::AddServices(_) => "add_services",
        Request::UpdateStatus(_) => "update_status",
        Request::DeleteBooking { .. } => "delete_booking",
        Request::GetBooking { .. } => "get_booking",
        Request::ListBookings { .. } => "list_bookings",
    }
}
