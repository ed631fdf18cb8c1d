use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::CalendarError;
use crate::catalog::CatalogError;
use crate::identity::IdentityError;
use crate::invoices::LedgerError;
use crate::model::{BookingStatus, Ms};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid {field}: {message}")]
    InvalidInput { field: &'static str, message: String },
    #[error("invalid duration: {0} minutes (must be positive)")]
    InvalidDuration(i64),
    #[error("{date} is closed: {reason}")]
    CalendarClosed { date: NaiveDate, reason: String },
    #[error("booking must lie within business hours {open}-{close}")]
    OutsideBusinessHours { open: String, close: String },
    #[error("calendar rules unavailable: {0}")]
    CalendarUnavailable(String),
    #[error("time slot no longer available (conflicts with booking {conflicting}); pick another time")]
    SlotConflict { conflicting: Ulid },
    #[error("you already have booking {existing} at this time")]
    DuplicateBooking { existing: Ulid },
    #[error("booking {existing} already exists at this time with the same contact details; use different contact details")]
    SuspiciousDuplicate { existing: Ulid },
    #[error("service {service_id} has no price for vehicle type {vehicle_type_id}")]
    UnpricedService { service_id: Ulid, vehicle_type_id: Ulid },
    #[error("unknown service: {0}")]
    UnknownService(Ulid),
    #[error("unknown vehicle type: {0}")]
    UnknownVehicleType(Ulid),
    #[error("booking vehicle {0} not found on this booking")]
    UnknownBookingVehicle(Ulid),
    #[error("too many booking attempts; retry in {retry_after_ms} ms")]
    RateLimited { retry_after_ms: Ms },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("cannot change status from {from} to {to}")]
    InvalidTransition { from: BookingStatus, to: BookingStatus },
    #[error("booking {id} is {status} and can no longer be modified")]
    BookingClosed { id: Ulid, status: BookingStatus },
    #[error("booking {0} has issued invoices; cancel it instead")]
    HasInvoices(Ulid),
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),
    #[error("identity resolution failed: {0}")]
    IdentityUnavailable(String),
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

impl EngineError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        EngineError::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// Stable snake_case label for the wire and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInput { .. } => "invalid_input",
            EngineError::InvalidDuration(_) => "invalid_duration",
            EngineError::CalendarClosed { .. } => "calendar_closed",
            EngineError::OutsideBusinessHours { .. } => "outside_business_hours",
            EngineError::CalendarUnavailable(_) => "calendar_unavailable",
            EngineError::SlotConflict { .. } => "slot_conflict",
            EngineError::DuplicateBooking { .. } => "duplicate_booking",
            EngineError::SuspiciousDuplicate { .. } => "suspicious_duplicate",
            EngineError::UnpricedService { .. } => "unpriced_service",
            EngineError::UnknownService(_) => "unknown_service",
            EngineError::UnknownVehicleType(_) => "unknown_vehicle_type",
            EngineError::UnknownBookingVehicle(_) => "unknown_booking_vehicle",
            EngineError::RateLimited { .. } => "rate_limited",
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::BookingClosed { .. } => "booking_closed",
            EngineError::HasInvoices(_) => "has_invoices",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::CatalogUnavailable(_) => "catalog_unavailable",
            EngineError::IdentityUnavailable(_) => "identity_unavailable",
            EngineError::PersistenceFailure(_) => "persistence_failure",
        }
    }

    /// HTTP-equivalent status.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::InvalidInput { .. }
            | EngineError::InvalidDuration(_)
            | EngineError::LimitExceeded(_)
            | EngineError::HasInvoices(_) => 400,
            EngineError::Forbidden(_) => 403,
            EngineError::NotFound(_) | EngineError::UnknownBookingVehicle(_) => 404,
            EngineError::SlotConflict { .. }
            | EngineError::DuplicateBooking { .. }
            | EngineError::SuspiciousDuplicate { .. }
            | EngineError::InvalidTransition { .. }
            | EngineError::BookingClosed { .. } => 409,
            EngineError::CalendarClosed { .. }
            | EngineError::OutsideBusinessHours { .. }
            | EngineError::UnpricedService { .. }
            | EngineError::UnknownService(_)
            | EngineError::UnknownVehicleType(_) => 422,
            EngineError::RateLimited { .. } => 429,
            EngineError::CalendarUnavailable(_)
            | EngineError::CatalogUnavailable(_)
            | EngineError::IdentityUnavailable(_) => 503,
            EngineError::PersistenceFailure(_) => 500,
        }
    }

    /// Whether the same request may succeed if simply sent again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::SlotConflict { .. }
                | EngineError::RateLimited { .. }
                | EngineError::PersistenceFailure(_)
                | EngineError::CalendarUnavailable(_)
                | EngineError::CatalogUnavailable(_)
                | EngineError::IdentityUnavailable(_)
        )
    }

    pub fn retry_after_ms(&self) -> Option<Ms> {
        match self {
            EngineError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

impl From<CalendarError> for EngineError {
    fn from(e: CalendarError) -> Self {
        EngineError::CalendarUnavailable(e.0)
    }
}

impl From<CatalogError> for EngineError {
    fn from(e: CatalogError) -> Self {
        EngineError::CatalogUnavailable(e.0)
    }
}

impl From<IdentityError> for EngineError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::NoContact => {
                EngineError::invalid("customer", "an email, a phone number or a name is required")
            }
            IdentityError::Unavailable(msg) => EngineError::IdentityUnavailable(msg),
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(e: LedgerError) -> Self {
        EngineError::PersistenceFailure(e.to_string())
    }
}
