//! Time Entry - One Append-Only Data File
//!
//! A time entry owns the data file for a single `(group, day_timestamp)`
//! bucket. Records are only ever appended; removal happens at the entry
//! level (the whole file goes away), never record by record.
//!
//! ## Size discipline
//!
//! Two sizes are tracked:
//! - `data_file_size`: bytes on disk. Monotonic, advanced by the appender.
//! - `written_size`: bytes that downstream observers are allowed to see.
//!   Advanced only after the kernel write for a record has completed, so a
//!   reader never observes a half-written record. `written_size <=
//!   data_file_size` at all times.
//!
//! ## Readers and close
//!
//! Every streaming reader holds a [`ReadGuard`] that bumps
//! `read_operations`. [`TimeEntry::close`] waits until the count drops to
//! zero before releasing the file, so an entry is never torn down under an
//! active reader.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, Notify};
use tracing::warn;

use zangetsu_core::record::{self, RecordHeader, HEADER_SIZE};

use crate::error::{Error, Result};

/// Name of the data file inside an entry directory.
pub const DATA_FILE_NAME: &str = "data";

/// One record handed back by the read path.
#[derive(Debug, Clone)]
pub struct RecordData {
    /// Byte offset of the record header in the data file
    pub offset: u64,

    /// Timestamp from the record header
    pub timestamp: u64,

    /// Corrupted flag from the record header
    pub corrupted: bool,

    /// Total on-disk length of the record
    pub record_size: u64,

    /// The complete framed record (header + payload + footer)
    pub framed: Bytes,

    /// Just the payload bytes
    pub payload: Bytes,
}

/// Append-only data file for one `(group, day_timestamp)` bucket.
pub struct TimeEntry {
    day_timestamp: u64,
    dir: PathBuf,
    data_path: PathBuf,

    /// Append handle; taken on close
    file: Mutex<Option<File>>,

    /// Serializes an append with whatever must happen just before it
    /// (the database emits its mutation event under this lock so event
    /// order equals file order)
    append_order: Mutex<()>,

    data_file_size: AtomicU64,
    written_size: AtomicU64,
    read_operations: AtomicUsize,
    closed: AtomicBool,
    idle: Notify,
}

impl TimeEntry {
    /// Open (or create) the entry directory and its data file.
    ///
    /// Existing bytes are trusted: both sizes start at the current file
    /// length, so a restarted server serves what it had.
    pub async fn open(dir: impl Into<PathBuf>, day_timestamp: u64) -> Result<Arc<Self>> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let data_path = dir.join(DATA_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&data_path)
            .await?;
        let len = file.metadata().await?.len();

        Ok(Arc::new(Self {
            day_timestamp,
            dir,
            data_path,
            file: Mutex::new(Some(file)),
            append_order: Mutex::new(()),
            data_file_size: AtomicU64::new(len),
            written_size: AtomicU64::new(len),
            read_operations: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            idle: Notify::new(),
        }))
    }

    pub fn day_timestamp(&self) -> u64 {
        self.day_timestamp
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn data_file_size(&self) -> u64 {
        self.data_file_size.load(Ordering::Acquire)
    }

    pub fn written_size(&self) -> u64 {
        self.written_size.load(Ordering::Acquire)
    }

    pub fn read_operations(&self) -> usize {
        self.read_operations.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn append_order(&self) -> &Mutex<()> {
        &self.append_order
    }

    /// Append one record built from `buffers`.
    ///
    /// Returns `(offset, record_size)` where `offset` is the byte position
    /// of the record header.
    pub async fn add(
        &self,
        buffers: &[&[u8]],
        timestamp: u64,
        corrupted: bool,
    ) -> Result<(u64, u64)> {
        let framed = record::encode_record(buffers, timestamp, corrupted);
        self.append_framed(framed).await
    }

    /// Append an already-framed record verbatim.
    ///
    /// Used by the replication apply path, which receives records exactly
    /// as they sit in the master's file.
    pub async fn append_framed(&self, framed: Bytes) -> Result<(u64, u64)> {
        let mut file = self.file.lock().await;
        let file = match file.as_mut() {
            Some(f) if !self.is_closed() => f,
            _ => return Err(Error::EntryClosed),
        };

        let offset = self.data_file_size.load(Ordering::Acquire);
        file.write_all(&framed).await?;

        let size = framed.len() as u64;
        self.data_file_size.store(offset + size, Ordering::Release);
        // Readers may see the record only once the write has completed.
        self.written_size.store(offset + size, Ordering::Release);

        Ok((offset, size))
    }

    /// Read the single record whose header starts at `offset`.
    pub async fn get(&self, offset: u64) -> Result<RecordData> {
        let written = self.written_size();
        if offset >= written {
            return Err(Error::OffsetOutOfRange {
                offset,
                written_size: written,
            });
        }
        if offset + HEADER_SIZE as u64 > written {
            return Err(zangetsu_core::Error::TruncatedRecord.into());
        }

        let mut file = File::open(&self.data_path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)
            .await
            .map_err(map_read_err)?;
        let header = RecordHeader::decode(&header_buf)?;

        let total = header.record_size() as u64;
        if offset + total > written {
            return Err(zangetsu_core::Error::TruncatedRecord.into());
        }

        let mut framed = vec![0u8; total as usize];
        framed[..HEADER_SIZE].copy_from_slice(&header_buf);
        file.read_exact(&mut framed[HEADER_SIZE..])
            .await
            .map_err(map_read_err)?;
        record::verify_footer(&framed)?;

        Ok(build_record(offset, header, Bytes::from(framed)))
    }

    /// Start a lazy scan at `offset`.
    ///
    /// The scanner holds a [`ReadGuard`], so the entry cannot be closed
    /// out from under it.
    pub async fn scan(self: &Arc<Self>, offset: u64) -> Result<EntryScanner> {
        if self.is_closed() {
            return Err(Error::EntryClosed);
        }
        let guard = self.read_guard();

        let mut file = File::open(&self.data_path).await?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }

        Ok(EntryScanner {
            entry: Arc::clone(self),
            reader: BufReader::new(file),
            offset,
            _guard: guard,
        })
    }

    /// Take a read guard on this entry.
    pub fn read_guard(self: &Arc<Self>) -> ReadGuard {
        self.read_operations.fetch_add(1, Ordering::AcqRel);
        ReadGuard {
            entry: Arc::clone(self),
        }
    }

    /// Mark the entry closed so new appends and scans fail immediately.
    /// Readers already in flight are unaffected.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Close the entry: reject new work, wait for active readers to
    /// finish, then flush and release the file.
    pub async fn close(&self) {
        self.mark_closed();

        loop {
            let notified = self.idle.notified();
            if self.read_operations.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }

        let mut file = self.file.lock().await;
        if let Some(f) = file.take() {
            if let Err(e) = f.sync_all().await {
                warn!(path = %self.data_path.display(), error = %e, "failed to sync data file on close");
            }
        }
    }
}

fn map_read_err(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        zangetsu_core::Error::TruncatedRecord.into()
    } else {
        e.into()
    }
}

fn build_record(offset: u64, header: RecordHeader, framed: Bytes) -> RecordData {
    let payload = framed.slice(HEADER_SIZE..HEADER_SIZE + header.payload_size as usize);
    RecordData {
        offset,
        timestamp: header.timestamp,
        corrupted: header.corrupted,
        record_size: header.record_size() as u64,
        framed,
        payload,
    }
}

/// Active-reader token. Dropping it releases the entry for close.
pub struct ReadGuard {
    entry: Arc<TimeEntry>,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        if self.entry.read_operations.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.entry.idle.notify_waiters();
        }
    }
}

/// Lazy streaming reader over an entry's records.
///
/// `next` yields records in file order up to the entry's current written
/// size, then `Ok(None)`. Appends that land while the scan is running are
/// picked up; the scan simply ends at whatever the frontier is when it
/// gets there.
pub struct EntryScanner {
    entry: Arc<TimeEntry>,
    reader: BufReader<File>,
    offset: u64,
    _guard: ReadGuard,
}

impl EntryScanner {
    /// Current scan position (the offset of the next record).
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next record, or `Ok(None)` at the written-size frontier.
    pub async fn next(&mut self) -> Result<Option<RecordData>> {
        let frontier = self.entry.written_size();
        if self.offset >= frontier {
            return Ok(None);
        }
        if self.offset + HEADER_SIZE as u64 > frontier {
            return Err(zangetsu_core::Error::TruncatedRecord.into());
        }

        let mut header_buf = [0u8; HEADER_SIZE];
        self.reader
            .read_exact(&mut header_buf)
            .await
            .map_err(map_read_err)?;
        let header = RecordHeader::decode(&header_buf)?;

        let total = header.record_size() as u64;
        if self.offset + total > frontier {
            return Err(zangetsu_core::Error::TruncatedRecord.into());
        }

        let mut framed = vec![0u8; total as usize];
        framed[..HEADER_SIZE].copy_from_slice(&header_buf);
        self.reader
            .read_exact(&mut framed[HEADER_SIZE..])
            .await
            .map_err(map_read_err)?;
        record::verify_footer(&framed)?;

        let rec = build_record(self.offset, header, Bytes::from(framed));
        self.offset += total;
        Ok(Some(rec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use zangetsu_core::record::{record_size, FOOTER_SIZE};

    async fn temp_entry() -> (TempDir, Arc<TimeEntry>) {
        let dir = TempDir::new().unwrap();
        let entry = TimeEntry::open(dir.path().join("86400"), 86_400)
            .await
            .unwrap();
        (dir, entry)
    }

    #[tokio::test]
    async fn add_then_get() {
        let (_dir, entry) = temp_entry().await;

        let (offset, size) = entry.add(&[b"hello world"], 86_400, false).await.unwrap();
        assert_eq!(offset, 0);
        assert_eq!(size, record_size(11) as u64);
        assert_eq!(entry.data_file_size(), size);
        assert_eq!(entry.written_size(), size);

        let rec = entry.get(0).await.unwrap();
        assert_eq!(rec.payload.as_ref(), b"hello world");
        assert_eq!(rec.timestamp, 86_400);
        assert!(!rec.corrupted);
        assert_eq!(rec.record_size, size);
    }

    #[tokio::test]
    async fn offsets_advance_by_record_size() {
        let (_dir, entry) = temp_entry().await;

        let (o1, _) = entry.add(&[b"hello"], 1, false).await.unwrap();
        let (o2, _) = entry.add(&[b"world!"], 2, false).await.unwrap();
        assert_eq!(o1, 0);
        assert_eq!(o2, (HEADER_SIZE + 5 + FOOTER_SIZE) as u64);

        let rec = entry.get(o2).await.unwrap();
        assert_eq!(rec.payload.as_ref(), b"world!");
    }

    #[tokio::test]
    async fn scan_yields_insertion_order_then_none() {
        let (_dir, entry) = temp_entry().await;

        let payloads: Vec<String> = (0..10).map(|i| format!("record-{i}")).collect();
        for (i, p) in payloads.iter().enumerate() {
            entry.add(&[p.as_bytes()], i as u64, false).await.unwrap();
        }

        let mut scanner = entry.scan(0).await.unwrap();
        let mut seen = Vec::new();
        while let Some(rec) = scanner.next().await.unwrap() {
            seen.push(String::from_utf8(rec.payload.to_vec()).unwrap());
        }
        assert_eq!(seen, payloads);

        // The frontier is reached exactly once; further polls stay None.
        assert!(scanner.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scan_from_mid_offset() {
        let (_dir, entry) = temp_entry().await;

        entry.add(&[b"first"], 1, false).await.unwrap();
        let (offset, _) = entry.add(&[b"second"], 2, false).await.unwrap();
        entry.add(&[b"third"], 3, false).await.unwrap();

        let mut scanner = entry.scan(offset).await.unwrap();
        let rec = scanner.next().await.unwrap().unwrap();
        assert_eq!(rec.payload.as_ref(), b"second");
        let rec = scanner.next().await.unwrap().unwrap();
        assert_eq!(rec.payload.as_ref(), b"third");
        assert!(scanner.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scan_picks_up_appends_past_creation() {
        let (_dir, entry) = temp_entry().await;

        entry.add(&[b"one"], 1, false).await.unwrap();
        let mut scanner = entry.scan(0).await.unwrap();
        assert!(scanner.next().await.unwrap().is_some());
        assert!(scanner.next().await.unwrap().is_none());

        entry.add(&[b"two"], 2, false).await.unwrap();
        let rec = scanner.next().await.unwrap().unwrap();
        assert_eq!(rec.payload.as_ref(), b"two");
    }

    #[tokio::test]
    async fn get_rejects_out_of_range_offset() {
        let (_dir, entry) = temp_entry().await;
        entry.add(&[b"data"], 1, false).await.unwrap();

        let err = entry.get(10_000).await.unwrap_err();
        assert!(matches!(err, Error::OffsetOutOfRange { .. }));
        assert!(!err.is_corruption());
    }

    #[tokio::test]
    async fn get_at_misaligned_offset_is_corruption() {
        let (_dir, entry) = temp_entry().await;
        entry.add(&[b"some longer payload"], 1, false).await.unwrap();
        entry.add(&[b"second"], 2, false).await.unwrap();

        // Offset 3 lands inside the first record: the magic check fails.
        let err = entry.get(3).await.unwrap_err();
        assert!(err.is_corruption());
    }

    #[tokio::test]
    async fn scan_reports_crc_corruption() {
        let (_dir, entry) = temp_entry().await;
        entry.add(&[b"payload payload"], 1, false).await.unwrap();

        // Flip a payload byte behind the entry's back.
        let data_path = entry.path().join(DATA_FILE_NAME);
        let mut bytes = std::fs::read(&data_path).unwrap();
        bytes[HEADER_SIZE + 2] ^= 0xFF;
        std::fs::write(&data_path, bytes).unwrap();

        let mut scanner = entry.scan(0).await.unwrap();
        let err = scanner.next().await.unwrap_err();
        assert!(err.is_corruption());
    }

    #[tokio::test]
    async fn corrupted_flag_survives_storage() {
        let (_dir, entry) = temp_entry().await;
        let (offset, _) = entry.add(&[b"suspect"], 5, true).await.unwrap();

        let rec = entry.get(offset).await.unwrap();
        assert!(rec.corrupted);
    }

    #[tokio::test]
    async fn close_waits_for_readers() {
        let (_dir, entry) = temp_entry().await;
        entry.add(&[b"data"], 1, false).await.unwrap();

        let scanner = entry.scan(0).await.unwrap();
        assert_eq!(entry.read_operations(), 1);

        let closing = {
            let entry = Arc::clone(&entry);
            tokio::spawn(async move { entry.close().await })
        };

        // The close must not complete while the scanner is alive.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!closing.is_finished());

        drop(scanner);
        tokio::time::timeout(Duration::from_secs(1), closing)
            .await
            .expect("close should finish once readers are gone")
            .unwrap();
        assert_eq!(entry.read_operations(), 0);
    }

    #[tokio::test]
    async fn closed_entry_rejects_new_work() {
        let (_dir, entry) = temp_entry().await;
        entry.add(&[b"data"], 1, false).await.unwrap();
        entry.close().await;

        assert!(matches!(
            entry.add(&[b"more"], 2, false).await,
            Err(Error::EntryClosed)
        ));
        assert!(matches!(entry.scan(0).await, Err(Error::EntryClosed)));
    }

    #[tokio::test]
    async fn reopen_recovers_existing_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("86400");

        let entry = TimeEntry::open(&path, 86_400).await.unwrap();
        entry.add(&[b"persisted"], 9, false).await.unwrap();
        let size = entry.written_size();
        entry.close().await;

        let entry = TimeEntry::open(&path, 86_400).await.unwrap();
        assert_eq!(entry.written_size(), size);
        let rec = entry.get(0).await.unwrap();
        assert_eq!(rec.payload.as_ref(), b"persisted");
    }
}
