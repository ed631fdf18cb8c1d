use chrono::Utc;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;
use super::store::DayState;

pub(crate) fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReport {
    /// Another blocking booking's interval overlaps.
    Overlap { with: Ulid },
    /// The same customer already has a blocking booking at this exact start.
    Duplicate { existing: Ulid },
    /// A different identity with the same email or phone booked this exact start.
    Suspicious { existing: Ulid },
}

impl From<ConflictReport> for EngineError {
    fn from(report: ConflictReport) -> Self {
        match report {
            ConflictReport::Overlap { with } => EngineError::SlotConflict { conflicting: with },
            ConflictReport::Duplicate { existing } => EngineError::DuplicateBooking { existing },
            ConflictReport::Suspicious { existing } => EngineError::SuspiciousDuplicate { existing },
        }
    }
}

/// First blocking booking on `day` overlapping `span`, ignoring `exclude`.
pub fn find_overlap(day: &DayState, span: &Span, exclude: Option<Ulid>) -> Option<ConflictReport> {
    day.overlapping(span)
        .filter(|b| b.is_blocking() && Some(b.id) != exclude)
        .find(|b| b.span().overlaps(span))
        .map(|b| ConflictReport::Overlap { with: b.id })
}

/// Double-submission checks for a brand-new booking starting at `start`.
pub fn find_duplicate(day: &DayState, start: Ms, customer: &CustomerSnapshot) -> Option<ConflictReport> {
    let same_start = day
        .blocking()
        .filter(|b| to_ms(b.scheduled_time) == start);

    let mut suspicious = None;
    for b in same_start {
        if b.customer.id == customer.id {
            return Some(ConflictReport::Duplicate { existing: b.id });
        }
        if suspicious.is_none() && same_contact(&b.customer, customer) {
            suspicious = Some(ConflictReport::Suspicious { existing: b.id });
        }
    }
    suspicious
}

/// Both snapshots carry normalized contact fields.
fn same_contact(a: &CustomerSnapshot, b: &CustomerSnapshot) -> bool {
    let email = matches!((&a.email, &b.email), (Some(x), Some(y)) if x == y);
    let phone = matches!((&a.phone, &b.phone), (Some(x), Some(y)) if x == y);
    email || phone
}

/// All checks for a new booking. Duplicate checks come first so a
/// double-submission reports as such rather than as a plain overlap.
pub fn check_new_booking(day: &DayState, span: &Span, customer: &CustomerSnapshot) -> Result<(), EngineError> {
    if let Some(report) = find_duplicate(day, span.start, customer) {
        return Err(report.into());
    }
    if let Some(report) = find_overlap(day, span, None) {
        return Err(report.into());
    }
    Ok(())
}
