use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::{Booking, BookingStatus, CustomerSnapshot};

const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NoticeKind {
    Created,
    Rescheduled,
    ServicesAdded,
    StatusChanged { status: BookingStatus },
}

/// Message for the customer about a committed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub booking_id: Ulid,
    pub kind: NoticeKind,
    pub customer: CustomerSnapshot,
    pub scheduled_time: DateTime<Utc>,
    pub estimated_end: DateTime<Utc>,
}

impl Notice {
    pub fn for_booking(booking: &Booking, kind: NoticeKind) -> Self {
        Self {
            booking_id: booking.id,
            kind,
            customer: booking.customer.clone(),
            scheduled_time: booking.scheduled_time,
            estimated_end: booking.estimated_end,
        }
    }
}

/// Email/SMS delivery. Implementations may fail; failures never reach the booking flow.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notice: &Notice) -> Result<(), NotifyError>;
}

/// Default notifier: writes the notice to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, notice: &Notice) -> Result<(), NotifyError> {
        tracing::info!(
            booking = %notice.booking_id,
            customer = %notice.customer.id,
            kind = ?notice.kind,
            "notify customer"
        );
        Ok(())
    }
}

/// Fire-and-forget queue drained by a background worker. Enqueueing happens
/// after the commit point and never blocks or fails the caller.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<Notice>,
}

impl NotificationQueue {
    /// Spawn the dispatch worker. Must be called inside a tokio runtime.
    pub fn start(notifier: Arc<dyn Notifier>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(dispatch_loop(notifier, rx));
        Self { tx }
    }

    pub fn enqueue(&self, notice: Notice) {
        let booking_id = notice.booking_id;
        if let Err(e) = self.tx.try_send(notice) {
            warn!("dropping notice for booking {booking_id}: {e}");
            metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
        }
    }
}

async fn dispatch_loop(notifier: Arc<dyn Notifier>, mut rx: mpsc::Receiver<Notice>) {
    while let Some(notice) = rx.recv().await {
        match notifier.deliver(&notice).await {
            Ok(()) => debug!("delivered notice for booking {}", notice.booking_id),
            Err(e) => {
                warn!("notice for booking {} not delivered: {e}", notice.booking_id);
                metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
            }
        }
    }
}
