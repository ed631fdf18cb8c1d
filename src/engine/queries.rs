use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::DayStatus;
use crate::model::*;

use super::availability::{AvailableSlots, NoSlotsReason, compute_slots, free_windows};
use super::{Engine, EngineError};

impl Engine {
    /// Offerable start times for `duration_minutes` on `date`. Recomputed from
    /// current state on every call.
    pub async fn available_slots(
        &self,
        date: NaiveDate,
        duration_minutes: i64,
    ) -> Result<AvailableSlots, EngineError> {
        if duration_minutes <= 0 {
            return Err(EngineError::InvalidDuration(duration_minutes));
        }

        let partial = match self.calendar.day_status(date).await? {
            DayStatus::Closed(reason) => {
                return Ok(AvailableSlots::empty(
                    date,
                    duration_minutes,
                    NoSlotsReason::Closed { reason },
                ));
            }
            DayStatus::Open { blocked } => blocked,
        };

        let hours = self.settings.hours;
        let window_minutes = hours.window_minutes();
        if duration_minutes > window_minutes {
            return Ok(AvailableSlots::empty(
                date,
                duration_minutes,
                NoSlotsReason::DurationTooLong {
                    duration_minutes,
                    window_minutes,
                },
            ));
        }

        let mut blocked: Vec<Span> = partial.iter().map(|b| b.span).collect();
        if let Some(day) = self.store.existing_day(date) {
            blocked.extend(day.read().await.blocking_spans());
        }

        let window = hours.window_on(date);
        let starts = compute_slots(window, duration_minutes as u32, &blocked);
        let free = free_windows(window, &blocked);
        if starts.is_empty() {
            let mut result = AvailableSlots::empty(date, duration_minutes, NoSlotsReason::FullyBooked);
            result.free_windows = free;
            return Ok(result);
        }

        Ok(AvailableSlots {
            date,
            duration_minutes,
            slots: starts.into_iter().filter_map(from_ms).collect(),
            free_windows: free,
            reason: None,
            message: None,
        })
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let date = self.store.date_of(&id).ok_or(EngineError::NotFound(id))?;
        let day = self.store.existing_day(date).ok_or(EngineError::NotFound(id))?;
        let guard = day.read().await;
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Every booking on `date`, any status, in start order.
    pub async fn list_bookings(&self, date: NaiveDate) -> Vec<Booking> {
        match self.store.existing_day(date) {
            Some(day) => day.read().await.bookings.clone(),
            None => Vec::new(),
        }
    }
}
