//! Wire payloads and their validated forms.
//!
//! `Raw*` types mirror whatever the client sent. `validate()` turns each into
//! a command whose every field has been checked, so nothing partially
//! validated reaches the engine.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::identity::ContactDetails;
use crate::limits::*;
use crate::model::{BookingStatus, instant_on};

// ── Raw payloads ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawContact {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawLine {
    pub service_id: Ulid,
    /// Kept loose: clients send numbers, numeric strings, and worse.
    #[serde(default)]
    pub quantity: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawVehicle {
    pub vehicle_type_id: Ulid,
    #[serde(default)]
    pub vehicle_info: Option<String>,
    #[serde(default)]
    pub vehicle_notes: Option<String>,
    #[serde(default)]
    pub services: Vec<RawLine>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCreateBooking {
    #[serde(default)]
    pub customer_id: Option<Ulid>,
    #[serde(default)]
    pub contact: Option<RawContact>,
    #[serde(default)]
    pub company_id: Option<Ulid>,
    pub scheduled_date: String,
    pub scheduled_time: String,
    #[serde(default)]
    pub vehicles: Vec<RawVehicle>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub admin_override: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawReschedule {
    pub booking_id: Ulid,
    #[serde(default)]
    pub new_date: Option<String>,
    #[serde(default)]
    pub new_time: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub admin_override: bool,
    #[serde(default)]
    pub notify_customer: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAddition {
    pub booking_vehicle_id: Ulid,
    pub service_id: Ulid,
    #[serde(default)]
    pub quantity: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAddServices {
    pub booking_id: Ulid,
    #[serde(default)]
    pub additions: Vec<RawAddition>,
    #[serde(default)]
    pub admin_override: bool,
    #[serde(default)]
    pub notify_customer: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawUpdateStatus {
    pub booking_id: Ulid,
    pub status: String,
    #[serde(default)]
    pub notify_customer: bool,
}

// ── Validated commands ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineOrder {
    pub service_id: Ulid,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleOrder {
    pub vehicle_type_id: Ulid,
    pub vehicle_info: Option<String>,
    pub vehicle_notes: Option<String>,
    /// At most one line per service.
    pub lines: Vec<LineOrder>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomerRef {
    Existing(Ulid),
    Contact(ContactDetails),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBooking {
    pub customer: CustomerRef,
    pub company_id: Option<Ulid>,
    pub date: NaiveDate,
    pub start: DateTime<Utc>,
    pub vehicles: Vec<VehicleOrder>,
    pub notes: Option<String>,
    pub admin_override: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescheduleBooking {
    pub booking_id: Ulid,
    pub date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
    pub status: Option<BookingStatus>,
    pub notes: Option<String>,
    pub admin_override: bool,
    pub notify_customer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAddition {
    pub booking_vehicle_id: Ulid,
    pub service_id: Ulid,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddServices {
    pub booking_id: Ulid,
    pub additions: Vec<ServiceAddition>,
    pub admin_override: bool,
    pub notify_customer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStatus {
    pub booking_id: Ulid,
    pub status: BookingStatus,
    pub notify_customer: bool,
}

// ── Field parsers ────────────────────────────────────────────────

pub fn parse_date(field: &'static str, s: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| EngineError::invalid(field, format!("expected YYYY-MM-DD, got {s:?}")))
}

/// Accepts `HH:MM`, `HH:MM:SS`, or a full RFC 3339 instant. For an instant the
/// UTC date is returned as well so callers can check it against the date field.
pub fn parse_time(field: &'static str, s: &str) -> Result<(Option<NaiveDate>, NaiveTime), EngineError> {
    let s = s.trim();
    if let Ok(t) = NaiveTime::parse_from_str(s, "%H:%M") {
        return Ok((None, t));
    }
    if let Ok(t) = NaiveTime::parse_from_str(s, "%H:%M:%S") {
        return Ok((None, t));
    }
    match DateTime::parse_from_rfc3339(s) {
        Ok(dt) => {
            let utc = dt.with_timezone(&Utc);
            Ok((Some(utc.date_naive()), utc.time()))
        }
        Err(_) => Err(EngineError::invalid(
            field,
            format!("expected HH:MM or an RFC 3339 timestamp, got {s:?}"),
        )),
    }
}

/// Present-but-invalid quantities fall back to 1; a missing one is rejected.
pub fn parse_quantity(value: Option<&Value>) -> Result<u32, EngineError> {
    let Some(value) = value else {
        return Err(EngineError::invalid("quantity", "quantity is required"));
    };
    let n = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match n {
        Some(n) if n > i64::from(MAX_QUANTITY) => Err(EngineError::LimitExceeded("quantity too large")),
        Some(n) if n >= 1 => Ok(n as u32),
        _ => Ok(1),
    }
}

fn clean_text(
    field: &'static str,
    value: Option<String>,
    max_len: usize,
) -> Result<Option<String>, EngineError> {
    let Some(v) = value else { return Ok(None) };
    let v = v.trim();
    if v.is_empty() {
        return Ok(None);
    }
    if v.len() > max_len {
        return Err(EngineError::invalid(field, format!("longer than {max_len} bytes")));
    }
    Ok(Some(v.to_string()))
}

fn parse_status(s: &str) -> Result<BookingStatus, EngineError> {
    BookingStatus::parse(s).ok_or_else(|| EngineError::invalid("status", format!("unknown status {s:?}")))
}

// ── Validation ───────────────────────────────────────────────────

impl RawContact {
    fn validate(self) -> Result<ContactDetails, EngineError> {
        let name = clean_text("name", self.name, MAX_NAME_LEN)?.unwrap_or_default();
        let email = clean_text("email", self.email, MAX_EMAIL_LEN)?;
        let phone = clean_text("phone", self.phone, MAX_PHONE_LEN)?;
        if let Some(e) = &email
            && !e.contains('@')
        {
            return Err(EngineError::invalid("email", format!("{e:?} is not an email address")));
        }
        if name.is_empty() && email.is_none() && phone.is_none() {
            return Err(EngineError::invalid("contact", "an email, a phone number or a name is required"));
        }
        Ok(ContactDetails { name, email, phone })
    }
}

impl RawVehicle {
    fn validate(self) -> Result<VehicleOrder, EngineError> {
        if self.services.is_empty() {
            return Err(EngineError::invalid("services", "every vehicle needs at least one service"));
        }
        if self.services.len() > MAX_LINES_PER_VEHICLE {
            return Err(EngineError::LimitExceeded("too many services on one vehicle"));
        }
        let mut lines: Vec<LineOrder> = Vec::with_capacity(self.services.len());
        for raw in &self.services {
            let quantity = parse_quantity(raw.quantity.as_ref())?;
            match lines.iter_mut().find(|l| l.service_id == raw.service_id) {
                Some(line) => {
                    line.quantity += quantity;
                    if line.quantity > MAX_QUANTITY {
                        return Err(EngineError::LimitExceeded("quantity too large"));
                    }
                }
                None => lines.push(LineOrder {
                    service_id: raw.service_id,
                    quantity,
                }),
            }
        }
        Ok(VehicleOrder {
            vehicle_type_id: self.vehicle_type_id,
            vehicle_info: clean_text("vehicle_info", self.vehicle_info, MAX_VEHICLE_INFO_LEN)?,
            vehicle_notes: clean_text("vehicle_notes", self.vehicle_notes, MAX_NOTES_LEN)?,
            lines,
        })
    }
}

impl RawCreateBooking {
    pub fn validate(self) -> Result<CreateBooking, EngineError> {
        let date = parse_date("scheduled_date", &self.scheduled_date)?;
        let (instant_date, time) = parse_time("scheduled_time", &self.scheduled_time)?;
        if let Some(d) = instant_date
            && d != date
        {
            return Err(EngineError::invalid(
                "scheduled_time",
                format!("falls on {d}, not on scheduled_date {date}"),
            ));
        }

        let customer = match (self.customer_id, self.contact) {
            (Some(id), _) => CustomerRef::Existing(id),
            (None, Some(contact)) => CustomerRef::Contact(contact.validate()?),
            (None, None) => {
                return Err(EngineError::invalid("customer", "customer_id or contact is required"));
            }
        };

        if self.vehicles.is_empty() {
            return Err(EngineError::invalid("vehicles", "at least one vehicle is required"));
        }
        if self.vehicles.len() > MAX_VEHICLES_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }
        let vehicles = self
            .vehicles
            .into_iter()
            .map(RawVehicle::validate)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CreateBooking {
            customer,
            company_id: self.company_id,
            date,
            start: instant_on(date, time),
            vehicles,
            notes: clean_text("notes", self.notes, MAX_NOTES_LEN)?,
            admin_override: self.admin_override,
        })
    }
}

impl RawReschedule {
    pub fn validate(self) -> Result<RescheduleBooking, EngineError> {
        let mut date = self
            .new_date
            .as_deref()
            .map(|s| parse_date("new_date", s))
            .transpose()?;
        let time = match self.new_time.as_deref() {
            None => None,
            Some(s) => {
                let (instant_date, t) = parse_time("new_time", s)?;
                match (date, instant_date) {
                    (Some(d), Some(i)) if d != i => {
                        return Err(EngineError::invalid(
                            "new_time",
                            format!("falls on {i}, not on new_date {d}"),
                        ));
                    }
                    (None, Some(i)) => date = Some(i),
                    _ => {}
                }
                Some(t)
            }
        };
        if date.is_none() && time.is_none() {
            return Err(EngineError::invalid("new_date", "new_date or new_time is required"));
        }
        Ok(RescheduleBooking {
            booking_id: self.booking_id,
            date,
            time,
            status: self.status.as_deref().map(parse_status).transpose()?,
            notes: clean_text("notes", self.notes, MAX_NOTES_LEN)?,
            admin_override: self.admin_override,
            notify_customer: self.notify_customer,
        })
    }
}

impl RawAddServices {
    pub fn validate(self) -> Result<AddServices, EngineError> {
        if self.additions.is_empty() {
            return Err(EngineError::invalid("additions", "at least one addition is required"));
        }
        if self.additions.len() > MAX_ADDITIONS_PER_REQUEST {
            return Err(EngineError::LimitExceeded("too many additions"));
        }
        let additions = self
            .additions
            .iter()
            .map(|a| {
                Ok(ServiceAddition {
                    booking_vehicle_id: a.booking_vehicle_id,
                    service_id: a.service_id,
                    quantity: parse_quantity(a.quantity.as_ref())?,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;
        Ok(AddServices {
            booking_id: self.booking_id,
            additions,
            admin_override: self.admin_override,
            notify_customer: self.notify_customer,
        })
    }
}

impl RawUpdateStatus {
    pub fn validate(self) -> Result<UpdateStatus, EngineError> {
        Ok(UpdateStatus {
            booking_id: self.booking_id,
            status: parse_status(&self.status)?,
            notify_customer: self.notify_customer,
        })
    }
}
