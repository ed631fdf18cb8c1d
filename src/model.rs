use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Interval arithmetic is done in this unit.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

pub fn to_ms(t: DateTime<Utc>) -> Ms {
    t.timestamp_millis()
}

pub fn from_ms(ms: Ms) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// The instant `time` on `date`, UTC.
pub fn instant_on(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    date.and_time(time).and_utc()
}

pub fn minutes(m: u32) -> TimeDelta {
    TimeDelta::minutes(i64::from(m))
}

// ── Booking aggregate ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    /// Blocking statuses occupy the calendar and take part in conflict checks.
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed | Self::InProgress)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_blocking()
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending | Confirmed, InProgress)
                | (InProgress, Completed)
                | (Pending | Confirmed | InProgress, Cancelled)
                | (Pending | Confirmed | InProgress, NoShow)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::NoShow => "NO_SHOW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "CONFIRMED" => Some(Self::Confirmed),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "CANCELLED" => Some(Self::Cancelled),
            "NO_SHOW" => Some(Self::NoShow),
            _ => None,
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerKind {
    /// Identity keyed by a unique email address.
    Registered,
    /// Walk-in customer without an email address.
    Anonymous,
}

/// Contact data copied onto the booking at creation time. Email and phone are
/// stored normalized so duplicate checks can compare them directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerSnapshot {
    pub id: Ulid,
    pub kind: CustomerKind,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// One priced line item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingService {
    pub id: Ulid,
    pub service_id: Ulid,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub total_price: Decimal,
    /// Minutes per unit, copied from the catalog when the line was created.
    pub duration: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingVehicle {
    pub id: Ulid,
    pub vehicle_type_id: Ulid,
    pub vehicle_info: Option<String>,
    pub vehicle_notes: Option<String>,
    pub services: Vec<BookingService>,
    pub total_duration: u32,
    pub total_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub scheduled_date: NaiveDate,
    pub scheduled_time: DateTime<Utc>,
    /// Minutes.
    pub total_duration: u32,
    pub estimated_end: DateTime<Utc>,
    pub total_price: Decimal,
    pub status: BookingStatus,
    pub customer: CustomerSnapshot,
    pub company_id: Option<Ulid>,
    pub vehicles: Vec<BookingVehicle>,
    pub notes: Option<String>,
    /// Set when the booking was created or last moved with calendar/conflict vetoes suppressed.
    pub admin_override: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::new(to_ms(self.scheduled_time), to_ms(self.estimated_end))
    }

    pub fn is_blocking(&self) -> bool {
        self.status.is_blocking()
    }

    pub fn vehicle_mut(&mut self, id: Ulid) -> Option<&mut BookingVehicle> {
        self.vehicles.iter_mut().find(|v| v.id == id)
    }
}

/// Journal record. Every variant carries a complete aggregate snapshot so one
/// record is one atomic write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        booking: Booking,
    },
    BookingUpdated {
        booking: Booking,
        previous_date: NaiveDate,
    },
    BookingDeleted {
        id: Ulid,
        date: NaiveDate,
    },
}

impl Event {
    /// Calendar dates whose day state this event touches.
    pub fn dates(&self) -> Vec<NaiveDate> {
        match self {
            Event::BookingCreated { booking } => vec![booking.scheduled_date],
            Event::BookingUpdated {
                booking,
                previous_date,
            } => {
                if *previous_date == booking.scheduled_date {
                    vec![*previous_date]
                } else {
                    vec![*previous_date, booking.scheduled_date]
                }
            }
            Event::BookingDeleted { date, .. } => vec![*date],
        }
    }
}
