use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;

use crate::calendar::ClosedReason;
use crate::limits::SLOT_STEP_MINUTES;
use crate::model::*;

use super::EngineError;

// ── Business hours ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl BusinessHours {
    pub fn new(open: NaiveTime, close: NaiveTime) -> Result<Self, EngineError> {
        if open >= close {
            return Err(EngineError::invalid(
                "business_hours",
                format!("opening time {open} must be before closing time {close}"),
            ));
        }
        Ok(Self { open, close })
    }

    pub fn window_minutes(&self) -> i64 {
        (self.close - self.open).num_minutes()
    }

    pub fn window_on(&self, date: NaiveDate) -> Span {
        Span::new(
            to_ms(instant_on(date, self.open)),
            to_ms(instant_on(date, self.close)),
        )
    }
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default(),
        }
    }
}

// ── Query result ──────────────────────────────────────────────────

/// Why a slot query came back empty. Callers distinguish these: a closed day,
/// a duration no single day can hold, and a day that is simply full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NoSlotsReason {
    Closed { reason: ClosedReason },
    DurationTooLong { duration_minutes: i64, window_minutes: i64 },
    FullyBooked,
}

impl std::fmt::Display for NoSlotsReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoSlotsReason::Closed { reason } => write!(f, "closed: {reason}"),
            NoSlotsReason::DurationTooLong {
                duration_minutes,
                window_minutes,
            } => write!(
                f,
                "duration of {duration_minutes} minutes is too long for a single day ({window_minutes} minutes of business hours)"
            ),
            NoSlotsReason::FullyBooked => f.write_str("no free slots on this date"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableSlots {
    pub date: NaiveDate,
    pub duration_minutes: i64,
    pub slots: Vec<DateTime<Utc>>,
    /// Gaps between blocked ranges inside business hours.
    pub free_windows: Vec<Span>,
    pub reason: Option<NoSlotsReason>,
    pub message: Option<String>,
}

impl AvailableSlots {
    pub fn empty(date: NaiveDate, duration_minutes: i64, reason: NoSlotsReason) -> Self {
        Self {
            date,
            duration_minutes,
            slots: Vec::new(),
            free_windows: Vec::new(),
            message: Some(reason.to_string()),
            reason: Some(reason),
        }
    }
}

// ── Slot algorithm ────────────────────────────────────────────────

/// Candidate starts at `step_ms` from `window.start`, each leaving room for
/// `duration_ms` before `window.end` (`start + duration == end` is allowed).
pub fn candidate_starts(window: Span, duration_ms: Ms, step_ms: Ms) -> impl Iterator<Item = Ms> {
    let last = window.end - duration_ms;
    (0..)
        .map(move |i: Ms| window.start + i * step_ms)
        .take_while(move |s| *s <= last)
}

/// Lazily filter candidates against `blocked`, which must be sorted and merged.
pub fn free_starts(
    window: Span,
    duration_ms: Ms,
    step_ms: Ms,
    blocked: &[Span],
) -> impl Iterator<Item = Ms> + '_ {
    candidate_starts(window, duration_ms, step_ms).filter(move |&start| {
        let candidate = Span::new(start, start + duration_ms);
        // First blocked range ending after the candidate starts is the only one that can matter.
        let idx = blocked.partition_point(|b| b.end <= candidate.start);
        blocked.get(idx).is_none_or(|b| !b.overlaps(&candidate))
    })
}

/// Slots for `duration_minutes` inside `window`, avoiding every `blocked` span.
pub fn compute_slots(window: Span, duration_minutes: u32, blocked: &[Span]) -> Vec<Ms> {
    let mut blocked = blocked.to_vec();
    blocked.sort_by_key(|s| s.start);
    let blocked = merge_overlapping(&blocked);
    free_starts(
        window,
        Ms::from(duration_minutes) * MINUTE_MS,
        Ms::from(SLOT_STEP_MINUTES) * MINUTE_MS,
        &blocked,
    )
    .collect()
}

/// Free gaps of `window` once `blocked` is removed.
pub fn free_windows(window: Span, blocked: &[Span]) -> Vec<Span> {
    let mut blocked = blocked.to_vec();
    blocked.sort_by_key(|s| s.start);
    subtract_intervals(&[window], &merge_overlapping(&blocked))
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Remove sorted, disjoint `to_remove` from sorted, disjoint `base`.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Span::new(current_start, b.end));
        }
    }

    result
}
