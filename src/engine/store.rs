use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

/// Every booking scheduled on one calendar date, sorted by start time.
/// The date's lock is the serialization point for all writes on that date.
#[derive(Debug, Clone)]
pub struct DayState {
    pub date: NaiveDate,
    pub bookings: Vec<Booking>,
}

pub type SharedDayState = Arc<RwLock<DayState>>;

impl DayState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            bookings: Vec::new(),
        }
    }

    /// Insert keeping start order. Replaces an existing entry with the same id.
    pub fn insert(&mut self, booking: Booking) {
        self.remove(booking.id);
        let pos = self
            .bookings
            .partition_point(|b| b.scheduled_time <= booking.scheduled_time);
        self.bookings.insert(pos, booking);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Bookings whose interval overlaps `query`, any status.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self
            .bookings
            .partition_point(|b| to_ms(b.scheduled_time) < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| to_ms(b.estimated_end) > query.start)
    }

    pub fn blocking(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(|b| b.is_blocking())
    }

    pub fn blocking_spans(&self) -> Vec<Span> {
        self.blocking().map(Booking::span).collect()
    }
}

/// In-memory projection of the journal: day states plus a booking → date index.
#[derive(Default)]
pub struct BookingStore {
    days: DashMap<NaiveDate, SharedDayState>,
    booking_day: DashMap<Ulid, NaiveDate>,
}

impl BookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the state for `date`, creating an empty one on first use.
    pub fn day(&self, date: NaiveDate) -> SharedDayState {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(date))))
            .value()
            .clone()
    }

    pub fn existing_day(&self, date: NaiveDate) -> Option<SharedDayState> {
        self.days.get(&date).map(|e| e.value().clone())
    }

    pub fn date_of(&self, booking_id: &Ulid) -> Option<NaiveDate> {
        self.booking_day.get(booking_id).map(|e| *e.value())
    }

    pub fn booking_count(&self) -> usize {
        self.booking_day.len()
    }

    /// Apply an event to one day (caller holds its write lock) and keep the index current.
    pub fn apply_event(&self, day: &mut DayState, event: &Event) {
        match event {
            Event::BookingCreated { booking } => {
                if booking.scheduled_date == day.date {
                    self.booking_day.insert(booking.id, day.date);
                    day.insert(booking.clone());
                }
            }
            Event::BookingUpdated { booking, .. } => {
                day.remove(booking.id);
                if booking.scheduled_date == day.date {
                    self.booking_day.insert(booking.id, day.date);
                    day.insert(booking.clone());
                }
            }
            Event::BookingDeleted { id, date } => {
                day.remove(*id);
                self.booking_day.remove_if(id, |_, d| d == date);
            }
        }
    }
}
