mod availability;
mod conflict;
mod error;
mod mutations;
mod pricing;
mod queries;
mod store;

pub use availability::{
    AvailableSlots, BusinessHours, NoSlotsReason, candidate_starts, compute_slots, free_windows,
    merge_overlapping, subtract_intervals,
};
pub use conflict::{ConflictReport, check_new_booking, find_duplicate, find_overlap};
pub use error::EngineError;
pub use pricing::{apply_additions, price_vehicles, recompute_totals};
pub use store::{BookingStore, DayState, SharedDayState};

use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{OwnedRwLockWriteGuard, mpsc, oneshot};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::calendar::CalendarRules;
use crate::catalog::Catalog;
use crate::identity::IdentityResolver;
use crate::invoices::InvoiceLedger;
use crate::journal::Journal;
use crate::limits::MAX_RELOCK_ATTEMPTS;
use crate::model::*;
use crate::notify::NotificationQueue;
use crate::ratelimit::{RateDecision, RateLimiter, RatePolicy};

// ── Group-commit journal channel ─────────────────────────

pub(super) enum JournalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        response: oneshot::Sender<io::Result<usize>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the journal and batches appends for group commit.
/// Waits for one append, drains whatever else is already queued, then does a
/// single fsync for the batch and answers every sender.
async fn journal_writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            JournalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut journal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(JournalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Compaction must see every append queued before it.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut journal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut journal, cmd);
        }
    }
}

fn commit_batch(journal: &mut Journal, mut batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(journal, &batch);
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    if let Err(e) = &result {
        warn!("journal batch of {} failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// All or nothing: every sender in the batch gets the same answer, so a
/// failed batch leaves no record of it on disk.
fn flush_batch(journal: &mut Journal, batch: &[PendingAppend]) -> io::Result<()> {
    for (event, _) in batch {
        if let Err(e) = journal.append_buffered(event) {
            journal.discard_pending();
            return Err(e);
        }
    }
    journal.flush_sync()
}

fn handle_non_append(journal: &mut Journal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { response } => {
            let _ = response.send(journal.compact());
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(journal.appends_since_compact());
        }
        JournalCommand::Append { event, response } => commit_batch(journal, vec![(event, response)]),
    }
}

// ── Engine ───────────────────────────────────────────────

/// Who is asking. Privileged callers bypass rate limiting and may engage
/// the override flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caller {
    pub client_addr: Option<IpAddr>,
    pub privileged: bool,
}

impl Caller {
    pub fn public(client_addr: Option<IpAddr>) -> Self {
        Self {
            client_addr,
            privileged: false,
        }
    }

    pub fn admin() -> Self {
        Self {
            client_addr: None,
            privileged: true,
        }
    }

    pub fn rate_key(&self) -> String {
        self.client_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "local".to_string())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Settings {
    pub hours: BusinessHours,
    pub rate_policy: RatePolicy,
}

/// Collaborators the engine talks to.
pub struct EngineDeps {
    pub calendar: CalendarRules,
    pub catalog: Arc<dyn Catalog>,
    pub identity: Arc<dyn IdentityResolver>,
    pub invoices: Arc<dyn InvoiceLedger>,
    pub limiter: Arc<RateLimiter>,
    pub notifications: NotificationQueue,
}

pub struct Engine {
    pub store: BookingStore,
    pub(super) journal_tx: mpsc::Sender<JournalCommand>,
    pub settings: Settings,
    pub(super) calendar: CalendarRules,
    pub(super) catalog: Arc<dyn Catalog>,
    pub(super) identity: Arc<dyn IdentityResolver>,
    pub(super) invoices: Arc<dyn InvoiceLedger>,
    pub(super) limiter: Arc<RateLimiter>,
    pub(super) notifications: NotificationQueue,
}

/// Write guards on one or more day states, always taken in ascending date order.
pub(super) struct DayLocks {
    guards: Vec<OwnedRwLockWriteGuard<DayState>>,
}

impl DayLocks {
    pub(super) fn get(&self, date: NaiveDate) -> Option<&DayState> {
        self.guards.iter().find(|g| g.date == date).map(|g| &**g)
    }
}

impl Engine {
    /// Replay the journal at `journal_path` and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn new(journal_path: PathBuf, settings: Settings, deps: EngineDeps) -> io::Result<Self> {
        let (journal, events) = Journal::open(&journal_path)?;
        Self::with_journal(journal, &events, settings, deps)
    }

    /// Start on an already opened journal, applying `events` replayed from it.
    pub fn with_journal(
        journal: Journal,
        events: &[Event],
        settings: Settings,
        deps: EngineDeps,
    ) -> io::Result<Self> {
        let (journal_tx, journal_rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer_loop(journal, journal_rx));

        let engine = Self {
            store: BookingStore::new(),
            journal_tx,
            settings,
            calendar: deps.calendar,
            catalog: deps.catalog,
            identity: deps.identity,
            invoices: deps.invoices,
            limiter: deps.limiter,
            notifications: deps.notifications,
        };

        // Sole owner of every day lock here, so try_write never contends.
        for event in events {
            for date in event.dates() {
                let day = engine.store.day(date);
                let mut guard = day
                    .try_write()
                    .map_err(|_| io::Error::other("journal replay: day state contended"))?;
                engine.store.apply_event(&mut guard, event);
            }
        }
        debug!(
            "replayed {} journal events into {} bookings",
            events.len(),
            engine.store.booking_count()
        );

        Ok(engine)
    }

    async fn journal_send(&self, event: &Event) -> Result<io::Result<()>, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::PersistenceFailure("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::PersistenceFailure("journal writer dropped response".into()))
    }

    /// Append via the group-commit writer. An I/O failure is retried once;
    /// replay upserts snapshots, so a record written twice is harmless.
    async fn journal_append(&self, event: &Event) -> Result<(), EngineError> {
        match self.journal_send(event).await? {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!("journal append failed, retrying once: {first}");
                self.journal_send(event)
                    .await?
                    .map_err(|e| EngineError::PersistenceFailure(e.to_string()))
            }
        }
    }

    /// Journal append + apply to every locked day the event touches. State
    /// changes only after the append is durable.
    pub(super) async fn persist_and_apply(
        &self,
        locks: &mut DayLocks,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.journal_append(event).await?;
        let dates = event.dates();
        for guard in locks.guards.iter_mut() {
            if dates.contains(&guard.date) {
                self.store.apply_event(guard, event);
            }
        }
        Ok(())
    }

    pub(super) async fn lock_days(&self, dates: &[NaiveDate]) -> DayLocks {
        let mut dates = dates.to_vec();
        dates.sort();
        dates.dedup();
        let mut guards = Vec::with_capacity(dates.len());
        for date in dates {
            guards.push(self.store.day(date).write_owned().await);
        }
        DayLocks { guards }
    }

    /// Lock the date currently holding `booking_id` (plus `extra`, if any) and
    /// return the locks with that date. The index is re-checked under the lock
    /// because a concurrent reschedule may have moved the booking meanwhile.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: Ulid,
        extra: Option<NaiveDate>,
    ) -> Result<(DayLocks, NaiveDate), EngineError> {
        for _ in 0..MAX_RELOCK_ATTEMPTS {
            let date = self
                .store
                .date_of(&booking_id)
                .ok_or(EngineError::NotFound(booking_id))?;
            let mut wanted = vec![date];
            wanted.extend(extra);
            let locks = self.lock_days(&wanted).await;
            if locks.get(date).is_some_and(|d| d.get(booking_id).is_some()) {
                return Ok((locks, date));
            }
        }
        Err(EngineError::PersistenceFailure(format!(
            "booking {booking_id} kept moving while being locked; retry"
        )))
    }

    /// Rewrite the journal as one snapshot per live booking. The writer task
    /// folds its own file, so appends racing with this call are never lost.
    pub async fn compact_journal(&self) -> Result<usize, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::PersistenceFailure("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::PersistenceFailure("journal writer dropped response".into()))?
            .map_err(|e| EngineError::PersistenceFailure(e.to_string()))
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .journal_tx
            .send(JournalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Drop rate-limiter keys whose window and lockout have lapsed.
    pub fn sweep_rate_limits(&self) -> usize {
        self.limiter
            .sweep(&self.settings.rate_policy, conflict::now_ms())
    }

    /// Gate an admin token attempt from `caller`. Failed attempts count
    /// against the caller's key under the same policy as booking creation;
    /// a locked-out caller is refused before `verify` runs.
    pub fn authorize_admin(&self, caller: &Caller, verify: impl FnOnce() -> bool) -> Result<(), EngineError> {
        let key = format!("auth:{}", caller.rate_key());
        let now = conflict::now_ms();
        if let Some(retry_after_ms) = self.limiter.locked_for(&key, now) {
            metrics::counter!(crate::observability::RATE_LIMITED_TOTAL).increment(1);
            return Err(EngineError::RateLimited { retry_after_ms });
        }
        if verify() {
            return Ok(());
        }

        metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
        warn!("failed admin authentication from {}", caller.rate_key());
        match self.limiter.check(&key, &self.settings.rate_policy, now) {
            RateDecision::Allowed { .. } => Err(EngineError::Forbidden("invalid admin token")),
            RateDecision::Limited { retry_after_ms } => {
                metrics::counter!(crate::observability::RATE_LIMITED_TOTAL).increment(1);
                Err(EngineError::RateLimited { retry_after_ms })
            }
        }
    }
}
