use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, thiserror::Error)]
#[error("calendar store unavailable: {0}")]
pub struct CalendarError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClosureKind {
    Holiday,
    Vacation,
    Manual,
    Other,
}

impl std::fmt::Display for ClosureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ClosureKind::Holiday => "holiday",
            ClosureKind::Vacation => "vacation",
            ClosureKind::Manual => "closed",
            ClosureKind::Other => "closed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holiday {
    pub name: String,
    pub date: NaiveDate,
    /// Recurring holidays match every year on the same month and day.
    #[serde(default)]
    pub recurring: bool,
}

impl Holiday {
    pub fn falls_on(&self, date: NaiveDate) -> bool {
        if self.recurring {
            self.date.month() == date.month() && self.date.day() == date.day()
        } else {
            self.date == date
        }
    }
}

/// A manually curated calendar exception.
///
/// With both `start_time` and `end_time` set (and ordered) the row closes only
/// that part of the day; otherwise it closes whole days from `date` through
/// `until` (inclusive). `recurring` rows repeat annually on `date`'s month and
/// day and ignore `until`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedDate {
    #[serde(default = "Ulid::new")]
    pub id: Ulid,
    pub date: NaiveDate,
    #[serde(default)]
    pub until: Option<NaiveDate>,
    #[serde(default)]
    pub start_time: Option<NaiveTime>,
    #[serde(default)]
    pub end_time: Option<NaiveTime>,
    pub kind: ClosureKind,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub recurring: bool,
}

impl ClosedDate {
    pub fn covers(&self, date: NaiveDate) -> bool {
        if self.recurring {
            return self.date.month() == date.month() && self.date.day() == date.day();
        }
        let last = self.until.unwrap_or(self.date).max(self.date);
        self.date <= date && date <= last
    }

    pub fn partial_window(&self) -> Option<(NaiveTime, NaiveTime)> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) if start < end => Some((start, end)),
            _ => None,
        }
    }

    fn reason(&self) -> ClosedReason {
        ClosedReason::Closure {
            kind: self.kind,
            reason: self.reason.clone(),
        }
    }
}

/// Why a day, or part of one, is not bookable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClosedReason {
    Weekend { day: Weekday },
    Holiday { name: String },
    Closure { kind: ClosureKind, reason: Option<String> },
}

impl std::fmt::Display for ClosedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClosedReason::Weekend { day } => write!(f, "closed on weekends ({day})"),
            ClosedReason::Holiday { name } => write!(f, "holiday: {name}"),
            ClosedReason::Closure { kind, reason: Some(r) } => write!(f, "{kind}: {r}"),
            ClosedReason::Closure { kind, reason: None } => write!(f, "{kind}"),
        }
    }
}

/// Partial-day closure projected onto a concrete date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedRange {
    pub span: Span,
    pub reason: ClosedReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayStatus {
    Closed(ClosedReason),
    Open { blocked: Vec<BlockedRange> },
}

#[async_trait]
pub trait CalendarStore: Send + Sync {
    async fn holidays_on(&self, date: NaiveDate) -> Result<Vec<Holiday>, CalendarError>;
    async fn closures_on(&self, date: NaiveDate) -> Result<Vec<ClosedDate>, CalendarError>;
}

// ── Rules ────────────────────────────────────────────────────────

/// Answers "is this date a non-working day?". Weekend first, then holidays,
/// then full-day closures; partial-day closures never close the whole day.
pub struct CalendarRules {
    store: Arc<dyn CalendarStore>,
    weekend: [Weekday; 2],
}

impl CalendarRules {
    pub fn new(store: Arc<dyn CalendarStore>, weekend: [Weekday; 2]) -> Self {
        Self { store, weekend }
    }

    pub async fn is_closed(&self, date: NaiveDate) -> Result<Option<ClosedReason>, CalendarError> {
        match self.day_status(date).await? {
            DayStatus::Closed(reason) => Ok(Some(reason)),
            DayStatus::Open { .. } => Ok(None),
        }
    }

    pub async fn day_status(&self, date: NaiveDate) -> Result<DayStatus, CalendarError> {
        let day = date.weekday();
        if self.weekend.contains(&day) {
            return Ok(DayStatus::Closed(ClosedReason::Weekend { day }));
        }

        let holidays = self.store.holidays_on(date).await?;
        if let Some(h) = holidays.iter().find(|h| h.falls_on(date)) {
            return Ok(DayStatus::Closed(ClosedReason::Holiday {
                name: h.name.clone(),
            }));
        }

        let closures = self.store.closures_on(date).await?;
        let mut blocked = Vec::new();
        for c in closures.iter().filter(|c| c.covers(date)) {
            match c.partial_window() {
                None => return Ok(DayStatus::Closed(c.reason())),
                Some((start, end)) => blocked.push(BlockedRange {
                    span: Span::new(to_ms(instant_on(date, start)), to_ms(instant_on(date, end))),
                    reason: c.reason(),
                }),
            }
        }
        blocked.sort_by_key(|b| b.span.start);
        Ok(DayStatus::Open { blocked })
    }
}

// ── In-memory store ──────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryCalendar {
    holidays: RwLock<Vec<Holiday>>,
    closures: RwLock<Vec<ClosedDate>>,
}

impl InMemoryCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_holiday(&self, holiday: Holiday) -> Result<(), CalendarError> {
        self.holidays.write().map_err(poisoned)?.push(holiday);
        Ok(())
    }

    pub fn add_closure(&self, closure: ClosedDate) -> Result<(), CalendarError> {
        self.closures.write().map_err(poisoned)?.push(closure);
        Ok(())
    }

    pub fn remove_closure(&self, id: Ulid) -> Result<bool, CalendarError> {
        let mut closures = self.closures.write().map_err(poisoned)?;
        let before = closures.len();
        closures.retain(|c| c.id != id);
        Ok(closures.len() != before)
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> CalendarError {
    CalendarError("calendar lock poisoned".into())
}

#[async_trait]
impl CalendarStore for InMemoryCalendar {
    async fn holidays_on(&self, date: NaiveDate) -> Result<Vec<Holiday>, CalendarError> {
        let holidays = self.holidays.read().map_err(poisoned)?;
        Ok(holidays.iter().filter(|h| h.falls_on(date)).cloned().collect())
    }

    async fn closures_on(&self, date: NaiveDate) -> Result<Vec<ClosedDate>, CalendarError> {
        let closures = self.closures.read().map_err(poisoned)?;
        Ok(closures.iter().filter(|c| c.covers(date)).cloned().collect())
    }
}
