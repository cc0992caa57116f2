use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::limits::MAX_WAL_RECORD_LEN;
use crate::model::Event;

/// Bytes of framing around each payload: length word plus checksum word.
const FRAME_OVERHEAD: u64 = 8;

/// Frame one event as `[u32 le: payload len][bincode payload][u32 le: crc32(payload)]`.
/// Returns the number of bytes written.
fn write_record(out: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_WAL_RECORD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("WAL record of {} bytes exceeds {MAX_WAL_RECORD_LEN}", payload.len()),
        ));
    }
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(&payload)?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(payload.len() as u64 + FRAME_OVERHEAD)
}

/// Read one framed event and its framed size. `Ok(None)` marks the end of the
/// usable log: clean EOF, a torn tail, an oversized length word, a CRC
/// mismatch, or an undecodable payload.
fn read_record(input: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut word = [0u8; 4];
    if !read_full(input, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_WAL_RECORD_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_full(input, &mut payload)? || !read_full(input, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload)
        .ok()
        .map(|event| (event, len as u64 + FRAME_OVERHEAD)))
}

fn read_full(input: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match input.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Every intact event at `path` plus the byte length of the intact prefix.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid_len = 0;
    while let Some((event, len)) = read_record(&mut reader)? {
        events.push(event);
        valid_len += len;
    }
    Ok((events, valid_len))
}

/// Append-only event log for one partition.
///
/// Appends are buffered; `flush_sync` makes everything appended so far durable.
/// `discard_unsynced` rolls the file back to the last durable length.
/// Compaction writes a replacement file next to the log and renames it over.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    synced_len: u64,
    unsynced_len: u64,
    unsynced_appends: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = Self::open_append(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            synced_len,
            unsynced_len: 0,
            unsynced_appends: 0,
        })
    }

    /// Replay the log at `path`, cut off any torn or corrupt tail, and open
    /// it for appending right after the last intact record.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = scan(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > valid_len
        {
            tracing::warn!(
                path = %path.display(),
                file_len = meta.len(),
                valid_len,
                "truncating unreadable WAL tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok((Self::open(path)?, events))
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn compact_path(&self) -> PathBuf {
        self.path.with_extension("wal.compact")
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        let written = write_record(&mut self.writer, event)?;
        self.unsynced_len += written;
        self.unsynced_appends += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len += self.unsynced_len;
        self.unsynced_len = 0;
        self.unsynced_appends = 0;
        Ok(())
    }

    /// Drop everything appended since the last successful `flush_sync`, both
    /// the buffered bytes and any that already reached the file.
    pub fn discard_unsynced(&mut self) -> io::Result<()> {
        let fresh = BufWriter::new(Self::open_append(&self.path)?);
        // `into_parts` hands back the buffer without writing it.
        let (file, _unwritten) = std::mem::replace(&mut self.writer, fresh).into_parts();
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.unsynced_appends);
        self.unsynced_len = 0;
        self.unsynced_appends = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `events`. The old log stays intact until the rename.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        self.flush_sync()?;
        let tmp = self.compact_path();
        let mut compacted_len = 0;
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for event in events {
                compacted_len += write_record(&mut out, event)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.writer = BufWriter::new(Self::open_append(&self.path)?);
        self.appends_since_compact = 0;
        self.synced_len = compacted_len;
        Ok(())
    }

    /// Every intact event in the log at `path`, in append order.
    /// A missing file is an empty log.
    #[cfg(test)]
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        scan(path).map(|(events, _)| events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GridSpec;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("chairtime_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn tenant_created() -> Event {
        Event::TenantCreated {
            id: Ulid::new(),
            name: Some("Navalha".into()),
            utc_offset_minutes: -180,
            grid: GridSpec::default(),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let tenant = tenant_created();
        let staff = Event::StaffAdded {
            id: Ulid::new(),
            tenant_id: Ulid::new(),
            name: Some("Caio".into()),
        };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&tenant).unwrap();
            wal.append(&staff).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![tenant, staff]);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = tmp_path("torn_tail.wal");
        let event = tenant_created();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn missing_file_is_empty() {
        let path = tmp_path("never_written.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = tenant_created();
        let bad = Event::TenantDeleted { id: Ulid::new() };
        {
            let mut f = File::create(&path).unwrap();
            write_record(&mut f, &good).unwrap();
            let payload = bincode::serialize(&bad).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compact_shrinks_and_keeps_appending() {
        let path = tmp_path("compact.wal");
        let tenant = tenant_created();
        let Event::TenantCreated { id: tenant_id, .. } = tenant else {
            unreachable!()
        };

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&tenant).unwrap();
        for _ in 0..10 {
            let id = Ulid::new();
            wal.append(&Event::StaffAdded { id, tenant_id, name: None }).unwrap();
            wal.append(&Event::StaffRemoved { id }).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 21);
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(std::slice::from_ref(&tenant)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted log should be smaller: {after} < {before}");

        let staff = Event::StaffAdded { id: Ulid::new(), tenant_id, name: None };
        wal.append(&staff).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![tenant, staff]);
    }

    #[test]
    fn buffered_appends_visible_after_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|_| tenant_created()).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn recover_truncates_torn_tail_before_appending() {
        let path = tmp_path("recover_torn.wal");
        let first = tenant_created();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let intact_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }

        let second = tenant_created();
        {
            let (mut wal, events) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn recover_truncates_after_bad_checksum() {
        let path = tmp_path("recover_bad_crc.wal");
        let good = tenant_created();
        {
            let mut f = File::create(&path).unwrap();
            write_record(&mut f, &good).unwrap();
            let payload = bincode::serialize(&Event::TenantDeleted { id: Ulid::new() }).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        let later = tenant_created();
        {
            let (mut wal, events) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![good.clone()]);
            wal.append(&later).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good, later]);
    }

    #[test]
    fn recover_missing_file_starts_empty() {
        let path = tmp_path("recover_missing.wal");
        let (mut wal, events) = Wal::recover(&path).unwrap();
        assert!(events.is_empty());
        let event = tenant_created();
        wal.append(&event).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn oversized_length_word_ends_the_log() {
        let path = tmp_path("oversized.wal");
        let good = tenant_created();
        {
            let mut f = File::create(&path).unwrap();
            write_record(&mut f, &good).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 16]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good.clone()]);
        let (_wal, events) = Wal::recover(&path).unwrap();
        assert_eq!(events, vec![good]);
    }

    #[test]
    fn discard_unsynced_drops_pending_records() {
        let path = tmp_path("discard.wal");
        let kept = tenant_created();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();
        let durable_len = fs::metadata(&path).unwrap().len();

        wal.append_buffered(&tenant_created()).unwrap();
        wal.append_buffered(&tenant_created()).unwrap();
        assert_eq!(wal.appends_since_compact(), 3);
        wal.discard_unsynced().unwrap();
        assert_eq!(wal.appends_since_compact(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), durable_len);

        let next = tenant_created();
        wal.append(&next).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, next]);
    }

    #[test]
    fn discard_after_compact_keeps_snapshot() {
        let path = tmp_path("discard_compact.wal");
        let tenant = tenant_created();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&tenant).unwrap();
        wal.append(&Event::TenantDeleted { id: Ulid::new() }).unwrap();
        wal.compact(std::slice::from_ref(&tenant)).unwrap();

        wal.append_buffered(&tenant_created()).unwrap();
        wal.flush_sync().unwrap();
        let durable = Wal::replay(&path).unwrap();
        wal.append_buffered(&tenant_created()).unwrap();
        wal.writer.flush().unwrap();
        wal.discard_unsynced().unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), durable);
    }
}
