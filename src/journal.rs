use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::{Booking, Event};

/// Bytes of framing around each payload: length prefix + CRC.
const FRAME_OVERHEAD: u64 = 8;

fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "journal record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one record. `Ok(None)` means clean end of file or a torn/corrupt record.
fn decode_record(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Some((event, len as u64 + FRAME_OVERHEAD))),
        Err(_) => Ok(None),
    }
}

/// `read_exact` that reports EOF as `false` instead of an error.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Fold a history into one `BookingCreated` per live booking, ordered by id.
pub fn fold_live(events: &[Event]) -> Vec<Event> {
    let mut live: BTreeMap<ulid::Ulid, &Booking> = BTreeMap::new();
    for event in events {
        match event {
            Event::BookingCreated { booking } | Event::BookingUpdated { booking, .. } => {
                live.insert(booking.id, booking);
            }
            Event::BookingDeleted { id, .. } => {
                live.remove(id);
            }
        }
    }
    live.into_values()
        .map(|b| Event::BookingCreated { booking: b.clone() })
        .collect()
}

/// Result of reading a journal back from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte length of the intact prefix. Anything after it is a torn write.
    pub valid_len: u64,
}

/// Where journal bytes land. `File` in production.
pub trait JournalSink: Write + Send {
    /// Make everything written so far durable.
    fn sync(&mut self) -> io::Result<()>;
    /// Cut the file back to `len` bytes; later appends continue from there.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    /// Continue on a freshly swapped-in file after compaction.
    fn replace_file(&mut self, file: File);
}

impl JournalSink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn replace_file(&mut self, file: File) {
        *self = file;
    }
}

/// Append-only booking journal.
///
/// Record format: `[u32 len][bincode Event][u32 crc32]`, little-endian.
/// Records are staged in memory and reach the sink only in `flush_sync`.
/// A failed flush discards the staged records and cuts the file back to the
/// last durable length, so a rejected record can never surface later.
pub struct Journal {
    sink: Box<dyn JournalSink>,
    pending: Vec<u8>,
    pending_records: u64,
    /// Length of the file as of the last successful flush.
    committed_len: u64,
    /// A failed write may have left bytes past `committed_len`.
    dirty: bool,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Journal {
    /// Replay `path` and open it for appending, cutting off any torn tail so
    /// new records are not written behind unreadable bytes.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        Self::open_with(path, |file: File| -> Box<dyn JournalSink> { Box::new(file) })
    }

    /// Like `open`, with the file wrapped by `wrap` before any write.
    pub fn open_with(
        path: &Path,
        wrap: impl FnOnce(File) -> Box<dyn JournalSink>,
    ) -> io::Result<(Self, Vec<Event>)> {
        let replay = Self::replay(path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        if file.metadata()?.len() > replay.valid_len {
            tracing::warn!(
                "journal {}: discarding torn tail after byte {}",
                path.display(),
                replay.valid_len
            );
            file.set_len(replay.valid_len)?;
        }
        let journal = Self {
            sink: wrap(file),
            pending: Vec::new(),
            pending_records: 0,
            committed_len: replay.valid_len,
            dirty: false,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        };
        Ok((journal, replay.events))
    }

    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();
        while let Some((event, size)) = decode_record(&mut reader)? {
            replay.events.push(event);
            replay.valid_len += size;
        }
        Ok(replay)
    }

    /// Stage one record. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        let mark = self.pending.len();
        if let Err(e) = encode_record(&mut self.pending, event) {
            self.pending.truncate(mark);
            return Err(e);
        }
        self.pending_records += 1;
        Ok(())
    }

    /// Drop every staged record without writing it.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
        self.pending_records = 0;
    }

    /// Write and fsync the staged records. On error none of them count:
    /// they are dropped and the file is cut back to its committed length.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        match self.write_pending() {
            Ok(()) => {
                self.committed_len += self.pending.len() as u64;
                self.appends_since_compact += self.pending_records;
                self.discard_pending();
                Ok(())
            }
            Err(e) => {
                self.discard_pending();
                self.dirty = true;
                self.restore_committed();
                Err(e)
            }
        }
    }

    fn write_pending(&mut self) -> io::Result<()> {
        if self.dirty {
            self.sink.truncate(self.committed_len)?;
            self.dirty = false;
        }
        if !self.pending.is_empty() {
            self.sink.write_all(&self.pending)?;
            self.sink.flush()?;
        }
        self.sink.sync()
    }

    fn restore_committed(&mut self) {
        match self.sink.truncate(self.committed_len) {
            Ok(()) => self.dirty = false,
            // Still dirty: the next flush truncates before writing.
            Err(e) => tracing::warn!(
                "journal {}: cannot cut back to byte {}: {e}",
                self.path.display(),
                self.committed_len
            ),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write a compacted journal next to `path`. Slow; does not touch the live file.
    pub fn write_compacted(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp = path.with_extension("journal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp)?);
        for event in events {
            encode_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the live one and reopen it.
    pub fn swap_compacted(&mut self) -> io::Result<()> {
        self.flush_sync()?;
        let tmp = self.path.with_extension("journal.tmp");
        fs::rename(&tmp, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.dirty = false;
        self.sink.replace_file(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Rewrite the journal as its live bookings only. Returns how many records remain.
    pub fn compact(&mut self) -> io::Result<usize> {
        self.flush_sync()?;
        let replay = Self::replay(&self.path)?;
        let live = fold_live(&replay.events);
        Self::write_compacted(&self.path, &live)?;
        self.swap_compacted()?;
        Ok(live.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("washbay_test_journal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn deleted(day: u32) -> Event {
        Event::BookingDeleted {
            id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2030, 1, day).unwrap(),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.journal");
        let events = vec![deleted(1), deleted(2)];
        {
            let (mut j, replayed) = Journal::open(&path).unwrap();
            assert!(replayed.is_empty());
            for e in &events {
                j.append_buffered(e).unwrap();
            }
            j.flush_sync().unwrap();
            assert_eq!(j.appends_since_compact(), 2);
        }
        let (_, replayed) = Journal::open(&path).unwrap();
        assert_eq!(replayed, events);
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let path = tmp_path("torn_tail.journal");
        let first = deleted(3);
        {
            let (mut j, _) = Journal::open(&path).unwrap();
            j.append_buffered(&first).unwrap();
            j.flush_sync().unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }
        let second = deleted(4);
        {
            let (mut j, replayed) = Journal::open(&path).unwrap();
            assert_eq!(replayed, vec![first.clone()]);
            j.append_buffered(&second).unwrap();
            j.flush_sync().unwrap();
        }
        // The record written after the torn bytes is readable.
        let replay = Journal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![first, second]);
    }

    #[test]
    fn corrupt_crc_stops_replay() {
        let path = tmp_path("corrupt_crc.journal");
        let event = deleted(5);
        {
            let payload = bincode::serialize(&event).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        let replay = Journal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn missing_file_replays_empty() {
        let path = tmp_path("missing.journal");
        assert!(Journal::replay(&path).unwrap().events.is_empty());
    }

    #[test]
    fn compaction_replaces_contents() {
        let path = tmp_path("compact.journal");
        let (mut j, _) = Journal::open(&path).unwrap();
        for d in 1..=5 {
            j.append_buffered(&deleted(d)).unwrap();
        }
        j.flush_sync().unwrap();

        let kept = vec![deleted(9)];
        Journal::write_compacted(j.path(), &kept).unwrap();
        j.swap_compacted().unwrap();
        assert_eq!(j.appends_since_compact(), 0);

        let extra = deleted(10);
        j.append_buffered(&extra).unwrap();
        j.flush_sync().unwrap();

        let replay = Journal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![kept[0].clone(), extra]);
    }

    #[test]
    fn failed_flush_leaves_nothing_behind() {
        use crate::testkit::FlakyDisk;
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU32, Ordering};

        let path = tmp_path("failed_flush.journal");
        let failures = Arc::new(AtomicU32::new(0));
        let (mut j, _) = Journal::open_with(&path, FlakyDisk::wrap(failures.clone())).unwrap();

        let kept = deleted(1);
        j.append_buffered(&kept).unwrap();
        j.flush_sync().unwrap();
        let durable_len = fs::metadata(&path).unwrap().len();

        failures.store(1, Ordering::SeqCst);
        j.append_buffered(&deleted(2)).unwrap();
        let err = j.flush_sync().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::StorageFull);
        // The half-written record was cut off again.
        assert_eq!(fs::metadata(&path).unwrap().len(), durable_len);
        assert_eq!(j.appends_since_compact(), 1);

        // The next flush carries only its own record.
        let next = deleted(3);
        j.append_buffered(&next).unwrap();
        j.flush_sync().unwrap();
        assert_eq!(j.appends_since_compact(), 2);

        let replay = Journal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![kept, next]);
        assert_eq!(replay.valid_len, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn discarded_records_are_never_written() {
        let path = tmp_path("discarded.journal");
        let (mut j, _) = Journal::open(&path).unwrap();
        j.append_buffered(&deleted(1)).unwrap();
        j.discard_pending();
        let kept = deleted(2);
        j.append_buffered(&kept).unwrap();
        j.flush_sync().unwrap();
        assert_eq!(Journal::replay(&path).unwrap().events, vec![kept]);
    }

    #[test]
    fn fold_keeps_latest_snapshot_and_drops_deleted() {
        use crate::model::*;
        use chrono::{NaiveTime, TimeDelta};
        use rust_decimal::Decimal;

        let date = NaiveDate::from_ymd_opt(2030, 1, 8).unwrap();
        let start = instant_on(date, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        let mut b = Booking {
            id: Ulid::new(),
            scheduled_date: date,
            scheduled_time: start,
            total_duration: 30,
            estimated_end: start + TimeDelta::minutes(30),
            total_price: Decimal::ONE,
            status: BookingStatus::Confirmed,
            customer: CustomerSnapshot {
                id: Ulid::new(),
                kind: CustomerKind::Anonymous,
                name: "x".into(),
                email: None,
                phone: None,
            },
            company_id: None,
            vehicles: Vec::new(),
            notes: None,
            admin_override: false,
            created_at: start,
            updated_at: start,
        };
        let gone = deleted(2);
        let Event::BookingDeleted { id: gone_id, date: gone_date } = gone.clone() else {
            unreachable!()
        };
        let mut history = vec![Event::BookingCreated { booking: b.clone() }];
        b.status = BookingStatus::Completed;
        history.push(Event::BookingUpdated { booking: b.clone(), previous_date: date });
        let mut doomed = b.clone();
        doomed.id = gone_id;
        doomed.scheduled_date = gone_date;
        history.push(Event::BookingCreated { booking: doomed });
        history.push(gone);

        assert_eq!(fold_live(&history), vec![Event::BookingCreated { booking: b }]);
    }

    #[test]
    fn compact_folds_own_history() {
        let path = tmp_path("compact_self.journal");
        let (mut j, _) = Journal::open(&path).unwrap();
        for d in 1..=3 {
            j.append_buffered(&deleted(d)).unwrap();
        }
        assert_eq!(j.compact().unwrap(), 0);
        assert!(Journal::replay(&path).unwrap().events.is_empty());
    }
}
