use chrono::{NaiveDate, Utc};
use tracing::{info, warn};
use ulid::Ulid;

use crate::calendar::DayStatus;
use crate::model::*;
use crate::notify::{Notice, NoticeKind};
use crate::ratelimit::RateDecision;
use crate::request::{AddServices, CreateBooking, CustomerRef, RescheduleBooking, UpdateStatus};

use super::conflict::{check_new_booking, find_overlap, now_ms};
use super::pricing::{apply_additions, price_vehicles, recompute_totals};
use super::{Caller, DayLocks, Engine, EngineError};

fn record_rejection(op: &'static str, err: &EngineError) {
    metrics::counter!(
        crate::observability::BOOKING_REJECTIONS_TOTAL,
        "op" => op,
        "reason" => err.kind()
    )
    .increment(1);
}

fn require_privileged(caller: &Caller, what: &'static str) -> Result<(), EngineError> {
    if caller.privileged {
        Ok(())
    } else {
        Err(EngineError::Forbidden(what))
    }
}

fn booking_in<'a>(locks: &'a DayLocks, date: NaiveDate, id: Ulid) -> Result<&'a Booking, EngineError> {
    locks
        .get(date)
        .and_then(|d| d.get(id))
        .ok_or(EngineError::NotFound(id))
}

fn ensure_open(booking: &Booking) -> Result<(), EngineError> {
    if booking.status.is_terminal() {
        return Err(EngineError::BookingClosed {
            id: booking.id,
            status: booking.status,
        });
    }
    Ok(())
}

impl Engine {
    /// Whole-day closures, business hours, and partial-day closures for `span` on `date`.
    async fn check_calendar(&self, date: NaiveDate, span: &Span) -> Result<(), EngineError> {
        let blocked = match self.calendar.day_status(date).await? {
            DayStatus::Closed(reason) => {
                return Err(EngineError::CalendarClosed {
                    date,
                    reason: reason.to_string(),
                });
            }
            DayStatus::Open { blocked } => blocked,
        };
        let hours = self.settings.hours;
        if !hours.window_on(date).contains_span(span) {
            return Err(EngineError::OutsideBusinessHours {
                open: hours.open.format("%H:%M").to_string(),
                close: hours.close.format("%H:%M").to_string(),
            });
        }
        if let Some(range) = blocked.iter().find(|b| b.span.overlaps(span)) {
            return Err(EngineError::CalendarClosed {
                date,
                reason: range.reason.to_string(),
            });
        }
        Ok(())
    }

    fn check_rate_limit(&self, caller: &Caller) -> Result<(), EngineError> {
        if caller.privileged {
            return Ok(());
        }
        let key = caller.rate_key();
        match self.limiter.check(&key, &self.settings.rate_policy, now_ms()) {
            RateDecision::Allowed { .. } => Ok(()),
            RateDecision::Limited { retry_after_ms } => {
                warn!("booking creation rate limited for {key}, retry in {retry_after_ms} ms");
                metrics::counter!(crate::observability::RATE_LIMITED_TOTAL).increment(1);
                Err(EngineError::RateLimited { retry_after_ms })
            }
        }
    }

    async fn resolve_customer(&self, customer: &CustomerRef) -> Result<CustomerSnapshot, EngineError> {
        match customer {
            CustomerRef::Existing(id) => self
                .identity
                .get(*id)
                .await?
                .ok_or(EngineError::NotFound(*id)),
            CustomerRef::Contact(contact) => Ok(self.identity.resolve(contact).await?),
        }
    }

    pub async fn create_booking(&self, caller: &Caller, req: CreateBooking) -> Result<Booking, EngineError> {
        let result = self.create_booking_inner(caller, req).await;
        if let Err(e) = &result {
            record_rejection("create_booking", e);
        }
        result
    }

    async fn create_booking_inner(&self, caller: &Caller, req: CreateBooking) -> Result<Booking, EngineError> {
        if req.admin_override {
            require_privileged(caller, "admin_override requires a privileged connection")?;
        }
        self.check_rate_limit(caller)?;
        let customer = self.resolve_customer(&req.customer).await?;

        // Pricing runs even under override; it also fixes the duration the
        // time checks need.
        let vehicles = price_vehicles(self.catalog.as_ref(), &req.vehicles).await?;
        let now = Utc::now();
        let mut booking = Booking {
            id: Ulid::new(),
            scheduled_date: req.date,
            scheduled_time: req.start,
            total_duration: 0,
            estimated_end: req.start,
            total_price: rust_decimal::Decimal::ZERO,
            status: BookingStatus::Confirmed,
            customer,
            company_id: req.company_id,
            vehicles,
            notes: req.notes,
            admin_override: req.admin_override,
            created_at: now,
            updated_at: now,
        };
        recompute_totals(&mut booking)?;
        let span = booking.span();

        if !req.admin_override {
            self.check_calendar(req.date, &span).await?;
        }

        let mut locks = self.lock_days(&[req.date]).await;
        if !req.admin_override {
            let day = locks
                .get(req.date)
                .ok_or_else(|| EngineError::PersistenceFailure("day lock missing".into()))?;
            check_new_booking(day, &span, &booking.customer)?;
        }
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut locks, &event).await?;
        drop(locks);

        let override_label = if booking.admin_override { "true" } else { "false" };
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL, "override" => override_label)
            .increment(1);
        info!(
            booking = %booking.id,
            start = %booking.scheduled_time,
            minutes = booking.total_duration,
            total = %booking.total_price,
            admin_override = booking.admin_override,
            "booking created"
        );
        self.notifications
            .enqueue(Notice::for_booking(&booking, NoticeKind::Created));
        Ok(booking)
    }

    pub async fn reschedule_booking(
        &self,
        caller: &Caller,
        req: RescheduleBooking,
    ) -> Result<Booking, EngineError> {
        let result = self.reschedule_booking_inner(caller, req).await;
        if let Err(e) = &result {
            record_rejection("reschedule_booking", e);
        }
        result
    }

    async fn reschedule_booking_inner(
        &self,
        caller: &Caller,
        req: RescheduleBooking,
    ) -> Result<Booking, EngineError> {
        require_privileged(caller, "rescheduling requires a privileged connection")?;

        let (mut locks, current_date) = self.resolve_booking_write(req.booking_id, req.date).await?;
        let current = booking_in(&locks, current_date, req.booking_id)?;
        ensure_open(current)?;

        let new_date = req.date.unwrap_or(current_date);
        let time = req.time.unwrap_or_else(|| current.scheduled_time.time());
        let mut updated = current.clone();
        updated.scheduled_date = new_date;
        updated.scheduled_time = instant_on(new_date, time);
        updated.estimated_end = updated.scheduled_time + minutes(updated.total_duration);
        if let Some(status) = req.status
            && status != current.status
        {
            if !current.status.can_transition_to(status) {
                return Err(EngineError::InvalidTransition {
                    from: current.status,
                    to: status,
                });
            }
            updated.status = status;
        }
        if let Some(notes) = req.notes {
            updated.notes = Some(notes);
        }
        updated.admin_override = req.admin_override;
        updated.updated_at = Utc::now();

        if !req.admin_override && updated.is_blocking() {
            let span = updated.span();
            self.check_calendar(new_date, &span).await?;
            let day = locks
                .get(new_date)
                .ok_or_else(|| EngineError::PersistenceFailure("day lock missing".into()))?;
            if let Some(report) = find_overlap(day, &span, Some(updated.id)) {
                return Err(report.into());
            }
        }

        let event = Event::BookingUpdated {
            booking: updated.clone(),
            previous_date: current_date,
        };
        self.persist_and_apply(&mut locks, &event).await?;
        drop(locks);

        info!(
            booking = %updated.id,
            from = %current_date,
            start = %updated.scheduled_time,
            "booking rescheduled"
        );
        if req.notify_customer {
            self.notifications
                .enqueue(Notice::for_booking(&updated, NoticeKind::Rescheduled));
        }
        Ok(updated)
    }

    /// Add services to an existing booking. All additions commit together or
    /// not at all; the new end time is conflict-checked against the rest of the day.
    pub async fn add_services(&self, caller: &Caller, req: AddServices) -> Result<Booking, EngineError> {
        let result = self.add_services_inner(caller, req).await;
        if let Err(e) = &result {
            record_rejection("add_services", e);
        }
        result
    }

    async fn add_services_inner(&self, caller: &Caller, req: AddServices) -> Result<Booking, EngineError> {
        require_privileged(caller, "adding services requires a privileged connection")?;

        let (mut locks, date) = self.resolve_booking_write(req.booking_id, None).await?;
        let current = booking_in(&locks, date, req.booking_id)?;
        ensure_open(current)?;

        let mut updated = current.clone();
        apply_additions(&mut updated, &req.additions, self.catalog.as_ref()).await?;
        updated.updated_at = Utc::now();

        if !req.admin_override {
            let day = locks
                .get(date)
                .ok_or_else(|| EngineError::PersistenceFailure("day lock missing".into()))?;
            if let Some(report) = find_overlap(day, &updated.span(), Some(updated.id)) {
                return Err(report.into());
            }
        }

        let event = Event::BookingUpdated {
            booking: updated.clone(),
            previous_date: date,
        };
        self.persist_and_apply(&mut locks, &event).await?;
        drop(locks);

        info!(
            booking = %updated.id,
            minutes = updated.total_duration,
            total = %updated.total_price,
            "services added"
        );
        if req.notify_customer {
            self.notifications
                .enqueue(Notice::for_booking(&updated, NoticeKind::ServicesAdded));
        }
        Ok(updated)
    }

    pub async fn update_status(&self, caller: &Caller, req: UpdateStatus) -> Result<Booking, EngineError> {
        require_privileged(caller, "status changes require a privileged connection")?;

        let (mut locks, date) = self.resolve_booking_write(req.booking_id, None).await?;
        let current = booking_in(&locks, date, req.booking_id)?;
        if !current.status.can_transition_to(req.status) {
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to: req.status,
            });
        }

        let mut updated = current.clone();
        updated.status = req.status;
        updated.updated_at = Utc::now();
        let event = Event::BookingUpdated {
            booking: updated.clone(),
            previous_date: date,
        };
        self.persist_and_apply(&mut locks, &event).await?;
        drop(locks);

        info!(booking = %updated.id, status = %updated.status, "booking status changed");
        if req.notify_customer {
            self.notifications.enqueue(Notice::for_booking(
                &updated,
                NoticeKind::StatusChanged {
                    status: updated.status,
                },
            ));
        }
        Ok(updated)
    }

    /// Physically remove a booking. Refused once invoices exist; cancel instead.
    pub async fn delete_booking(&self, caller: &Caller, id: Ulid) -> Result<(), EngineError> {
        require_privileged(caller, "deleting bookings requires a privileged connection")?;

        let (mut locks, date) = self.resolve_booking_write(id, None).await?;
        if self.invoices.has_invoices(id).await? {
            return Err(EngineError::HasInvoices(id));
        }
        let event = Event::BookingDeleted { id, date };
        self.persist_and_apply(&mut locks, &event).await?;
        info!(booking = %id, %date, "booking deleted");
        Ok(())
    }
}
