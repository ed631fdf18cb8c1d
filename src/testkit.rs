//! Engine fixtures shared by the unit tests.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, Weekday};
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::calendar::{CalendarError, CalendarRules, CalendarStore, ClosedDate, Holiday, InMemoryCalendar};
use crate::catalog::{InMemoryCatalog, ServiceInfo, VehicleTypeInfo};
use crate::engine::{Engine, EngineDeps, Settings};
use crate::identity::{ContactDetails, InMemoryDirectory};
use crate::invoices::InMemoryLedger;
use crate::journal::{Journal, JournalSink};
use crate::notify::{LogNotifier, NotificationQueue, Notifier};
use crate::ratelimit::RateLimiter;
use crate::request::{CreateBooking, CustomerRef, LineOrder, VehicleOrder};

pub(crate) fn test_journal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("washbay_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(path.with_extension("journal.tmp"));
    path
}

/// Tuesday.
pub(crate) fn tuesday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 8).unwrap()
}

pub(crate) fn wednesday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 9).unwrap()
}

pub(crate) fn saturday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 12).unwrap()
}

pub(crate) fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

pub(crate) struct Options {
    pub settings: Settings,
    pub calendar_store: Option<Arc<dyn CalendarStore>>,
    pub notifier: Arc<dyn Notifier>,
    /// Put the journal on a `FlakyDisk` driven by this counter.
    pub disk_failures: Option<Arc<AtomicU32>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            calendar_store: None,
            notifier: Arc::new(LogNotifier),
            disk_failures: None,
        }
    }
}

/// An engine over in-memory collaborators with a small car-wash catalog:
/// wash 30 min / 25.00, detail 60 min / 80.00, wax 45 min / 40.00, and
/// `unpriced` with no price row for `car`.
pub(crate) struct Harness {
    pub engine: Arc<Engine>,
    pub path: PathBuf,
    pub catalog: Arc<InMemoryCatalog>,
    pub calendar: Arc<InMemoryCalendar>,
    pub invoices: Arc<InMemoryLedger>,
    pub car: Ulid,
    pub wash: Ulid,
    pub detail: Ulid,
    pub wax: Ulid,
    pub unpriced: Ulid,
}

impl Harness {
    pub fn new(name: &str) -> Self {
        Self::with(name, Options::default())
    }

    pub fn with(name: &str, opts: Options) -> Self {
        let catalog = Arc::new(InMemoryCatalog::new());
        let (car, wash, detail, wax, unpriced) =
            (Ulid::new(), Ulid::new(), Ulid::new(), Ulid::new(), Ulid::new());
        catalog.add_vehicle_type(VehicleTypeInfo { id: car, name: "car".into() });
        for (id, name, duration) in [
            (wash, "wash", 30),
            (detail, "detail", 60),
            (wax, "wax", 45),
            (unpriced, "ceramic coat", 120),
        ] {
            catalog.add_service(ServiceInfo { id, name: name.into(), duration, category: None });
        }
        catalog.set_price(wash, car, Decimal::new(2500, 2));
        catalog.set_price(detail, car, Decimal::new(8000, 2));
        catalog.set_price(wax, car, Decimal::new(4000, 2));

        let path = test_journal_path(name);
        let calendar = Arc::new(InMemoryCalendar::new());
        let invoices = Arc::new(InMemoryLedger::new());
        let engine = build_engine(&path, &opts, catalog.clone(), calendar.clone(), invoices.clone());
        Self {
            engine: Arc::new(engine),
            path,
            catalog,
            calendar,
            invoices,
            car,
            wash,
            detail,
            wax,
            unpriced,
        }
    }

    /// A fresh engine replaying the same journal with the same collaborators.
    pub fn reopen(&self) -> Engine {
        build_engine(
            &self.path,
            &Options::default(),
            self.catalog.clone(),
            self.calendar.clone(),
            self.invoices.clone(),
        )
    }

    pub fn order(&self, date: NaiveDate, time: NaiveTime, services: &[Ulid], email: &str) -> CreateBooking {
        CreateBooking {
            customer: CustomerRef::Contact(ContactDetails {
                name: email.split('@').next().unwrap_or_default().to_string(),
                email: Some(email.to_string()),
                phone: None,
            }),
            company_id: None,
            date,
            start: crate::model::instant_on(date, time),
            vehicles: vec![VehicleOrder {
                vehicle_type_id: self.car,
                vehicle_info: Some("blue hatchback".into()),
                vehicle_notes: None,
                lines: services
                    .iter()
                    .map(|&service_id| LineOrder { service_id, quantity: 1 })
                    .collect(),
            }],
            notes: None,
            admin_override: false,
        }
    }
}

fn build_engine(
    path: &Path,
    opts: &Options,
    catalog: Arc<InMemoryCatalog>,
    calendar: Arc<InMemoryCalendar>,
    invoices: Arc<InMemoryLedger>,
) -> Engine {
    let store: Arc<dyn CalendarStore> = match &opts.calendar_store {
        Some(s) => s.clone(),
        None => calendar as Arc<dyn CalendarStore>,
    };
    let deps = EngineDeps {
        calendar: CalendarRules::new(store, [Weekday::Sat, Weekday::Sun]),
        catalog,
        identity: Arc::new(InMemoryDirectory::new()),
        invoices,
        limiter: Arc::new(RateLimiter::new()),
        notifications: NotificationQueue::start(opts.notifier.clone()),
    };
    let engine = match &opts.disk_failures {
        Some(failures) => {
            let (journal, events) = Journal::open_with(path, FlakyDisk::wrap(failures.clone())).unwrap();
            Engine::with_journal(journal, &events, opts.settings, deps)
        }
        None => Engine::new(path.to_path_buf(), opts.settings, deps),
    };
    engine.unwrap()
}

/// Journal file that fails the next `failures` writes. Each failed write
/// leaves half its buffer on disk, like a device filling up mid-record.
pub(crate) struct FlakyDisk {
    file: File,
    failures: Arc<AtomicU32>,
}

impl FlakyDisk {
    pub fn wrap(failures: Arc<AtomicU32>) -> impl FnOnce(File) -> Box<dyn JournalSink> {
        move |file: File| -> Box<dyn JournalSink> { Box::new(FlakyDisk { file, failures }) }
    }

    fn trip(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Write for FlakyDisk {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.trip() {
            self.file.write_all(&buf[..buf.len() / 2])?;
            return Err(io::Error::new(io::ErrorKind::StorageFull, "no space left on device"));
        }
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl JournalSink for FlakyDisk {
    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn replace_file(&mut self, file: File) {
        self.file = file;
    }
}

/// Calendar store whose backing database is down.
pub(crate) struct BrokenCalendar;

#[async_trait]
impl CalendarStore for BrokenCalendar {
    async fn holidays_on(&self, _date: NaiveDate) -> Result<Vec<Holiday>, CalendarError> {
        Err(CalendarError("connection refused".into()))
    }

    async fn closures_on(&self, _date: NaiveDate) -> Result<Vec<ClosedDate>, CalendarError> {
        Err(CalendarError("connection refused".into()))
    }
}
