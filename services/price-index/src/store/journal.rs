//! Journal-backed snapshot store
//!
//! Every committed row is appended to a single file and fsynced before the
//! batch is acknowledged. On open the journal is replayed into an in-memory
//! index, which then serves all reads.
//!
//! # Binary Format (per row)
//! ```text
//! [payload_len: u32]
//! [payload:     bytes]   // bincode(PriceSnapshot)
//! [checksum:    u32]     // CRC32C over payload
//! ```
//!
//! A frame cut short at the end of the file is a torn write from a crash and
//! is truncated away. A complete frame whose checksum does not match is
//! corruption and refuses to open. A batch whose write fails at runtime is
//! rolled back to the previous length, so later batches never land behind a
//! partial frame.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use crc32c::crc32c;
use tracing::{debug, error, info, warn};
use types::numeric::Currency;
use types::snapshot::PriceSnapshot;

use super::memory::MemorySnapshotStore;
use super::{ScanRequest, SnapshotStore, UpsertOutcome};
use crate::error::StoreError;

/// Frames larger than this are treated as corruption rather than allocated.
const MAX_FRAME_LEN: usize = 1 << 20;

/// Encode one row as a journal frame.
fn encode_frame(row: &PriceSnapshot, buf: &mut Vec<u8>) -> Result<(), StoreError> {
    let payload = bincode::serialize(row).map_err(|e| StoreError::Serialization(e.to_string()))?;
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32c(&payload).to_le_bytes());
    Ok(())
}

/// The append side of a journal file.
trait JournalSink: Write {
    fn end_offset(&mut self) -> std::io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()>;
    fn sync(&mut self) -> std::io::Result<()>;
}

impl JournalSink for File {
    fn end_offset(&mut self) -> std::io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)?;
        self.sync_data()
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data()
    }
}

/// Why a batch append failed.
#[derive(Debug)]
enum AppendError {
    /// Nothing from the batch remains in the journal.
    RolledBack(std::io::Error),
    /// Partial bytes may remain; the journal must not be appended to again.
    Wedged { write: std::io::Error, rollback: std::io::Error },
}

/// Append `buf` durably, or leave the journal at its previous length.
fn append_batch<S: JournalSink>(sink: &mut S, buf: &[u8]) -> Result<(), AppendError> {
    let start = sink.end_offset().map_err(AppendError::RolledBack)?;
    let written = sink
        .write_all(buf)
        .and_then(|()| sink.flush())
        .and_then(|()| sink.sync());
    match written {
        Ok(()) => Ok(()),
        Err(write) => match sink.truncate_to(start) {
            Ok(()) => Err(AppendError::RolledBack(write)),
            Err(rollback) => Err(AppendError::Wedged { write, rollback }),
        },
    }
}

/// Result of replaying a journal image.
#[derive(Debug)]
struct Replay {
    rows: Vec<PriceSnapshot>,
    /// Offset just past the last intact frame.
    valid_len: u64,
    torn_tail: bool,
}

fn replay(data: &[u8]) -> Result<Replay, StoreError> {
    let mut rows = Vec::new();
    let mut pos = 0usize;

    while pos < data.len() {
        let remaining = &data[pos..];
        if remaining.len() < 4 {
            return Ok(Replay {
                rows,
                valid_len: pos as u64,
                torn_tail: true,
            });
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&remaining[..4]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(StoreError::Corrupt {
                offset: pos as u64,
                reason: format!("implausible frame length {}", len),
            });
        }
        if remaining.len() < 4 + len + 4 {
            return Ok(Replay {
                rows,
                valid_len: pos as u64,
                torn_tail: true,
            });
        }

        let payload = &remaining[4..4 + len];
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&remaining[4 + len..8 + len]);
        let stored = u32::from_le_bytes(crc_bytes);
        let computed = crc32c(payload);
        if stored != computed {
            return Err(StoreError::Corrupt {
                offset: pos as u64,
                reason: format!("checksum mismatch: stored={:#010x}, computed={:#010x}", stored, computed),
            });
        }

        let row: PriceSnapshot = bincode::deserialize(payload).map_err(|e| StoreError::Corrupt {
            offset: pos as u64,
            reason: format!("undecodable row: {}", e),
        })?;
        rows.push(row);
        pos += 8 + len;
    }

    Ok(Replay {
        rows,
        valid_len: pos as u64,
        torn_tail: false,
    })
}

/// Durable snapshot store backed by an append-only journal file.
pub struct JournalSnapshotStore {
    path: PathBuf,
    index: MemorySnapshotStore,
    file: Arc<Mutex<File>>,
    /// Serializes writers so the new-key check and the append are atomic.
    write_gate: tokio::sync::Mutex<()>,
    /// Set when a failed batch could not be rolled back.
    wedged: Arc<AtomicBool>,
}

impl std::fmt::Debug for JournalSnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalSnapshotStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl JournalSnapshotStore {
    /// Open (or create) the journal at `path` and replay it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let open_path = path.clone();
        let (file, rows) = tokio::task::spawn_blocking(move || open_and_replay(&open_path))
            .await
            .map_err(|e| StoreError::Io(format!("journal open task failed: {}", e)))??;

        let index = MemorySnapshotStore::new();
        let restored = rows.len();
        index.insert_committed(rows).await;
        info!(path = %path.display(), rows = restored, "Snapshot journal opened");

        Ok(Self {
            path,
            index,
            file: Arc::new(Mutex::new(file)),
            write_gate: tokio::sync::Mutex::new(()),
            wedged: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_and_replay(path: &Path) -> Result<(File, Vec<PriceSnapshot>), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?;

    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    let replayed = replay(&data)?;

    if replayed.torn_tail {
        warn!(
            path = %path.display(),
            valid_len = replayed.valid_len,
            file_len = data.len(),
            "Truncating torn journal tail"
        );
        file.set_len(replayed.valid_len)?;
        file.sync_data()?;
    }

    Ok((file, replayed.rows))
}

#[async_trait]
impl SnapshotStore for JournalSnapshotStore {
    async fn upsert_many(&self, rows: Vec<PriceSnapshot>) -> Result<UpsertOutcome, StoreError> {
        let _gate = self.write_gate.lock().await;
        if self.wedged.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable(
                "journal holds an unrolled partial batch".to_string(),
            ));
        }

        let (fresh, duplicates) = self.index.filter_new(&rows).await;
        if fresh.is_empty() {
            return Ok(UpsertOutcome {
                inserted: Vec::new(),
                duplicates,
            });
        }

        let mut buf = Vec::new();
        for row in &fresh {
            encode_frame(row, &mut buf)?;
        }
        let bytes = buf.len();

        let file = Arc::clone(&self.file);
        let wedged = Arc::clone(&self.wedged);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut file = file
                .lock()
                .map_err(|_| StoreError::Unavailable("journal writer poisoned".to_string()))?;
            match append_batch(&mut *file, &buf) {
                Ok(()) => Ok(()),
                Err(AppendError::RolledBack(e)) => {
                    warn!(path = %path.display(), error = %e, "Journal write failed, batch rolled back");
                    Err(e.into())
                }
                Err(AppendError::Wedged { write, rollback }) => {
                    error!(
                        path = %path.display(),
                        write_error = %write,
                        rollback_error = %rollback,
                        "Journal rollback failed, refusing further writes"
                    );
                    wedged.store(true, Ordering::Release);
                    Err(StoreError::Unavailable(format!("journal rollback failed: {}", rollback)))
                }
            }
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("journal write task failed: {}", e)))??;

        let inserted = self.index.insert_committed(fresh).await;
        debug!(
            inserted = inserted.len(),
            duplicates,
            bytes,
            "Journal batch committed"
        );
        Ok(UpsertOutcome {
            inserted,
            duplicates,
        })
    }

    async fn scan(&self, request: &ScanRequest) -> Result<Vec<PriceSnapshot>, StoreError> {
        self.index.scan(request).await
    }

    async fn currencies(&self) -> Result<Vec<Currency>, StoreError> {
        self.index.currencies().await
    }

    async fn len(&self) -> Result<usize, StoreError> {
        self.index.len().await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.file
            .lock()
            .map(|_| ())
            .map_err(|_| StoreError::Unavailable("journal writer poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::io::Seek;
    use types::ids::{CardId, MarketplaceId};
    use types::variant::{Condition, DimensionFilter, Language};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn row(minutes: i64, card: u64) -> PriceSnapshot {
        PriceSnapshot {
            time: t0() + Duration::minutes(minutes),
            card_id: CardId::new(card),
            marketplace_id: MarketplaceId::new(2),
            condition: Condition::LightlyPlayed,
            is_foil: true,
            language: Language::Japanese,
            price: Decimal::new(12_345, 2),
            price_low: Some(Decimal::new(10_000, 2)),
            price_mid: None,
            price_high: None,
            price_market: Some(Decimal::new(12_000, 2)),
            currency: Currency::EUR,
            num_listings: Some(3),
            total_quantity: Some(11),
            source: "cardmarket".to_string(),
        }
    }

    #[tokio::test]
    async fn test_rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.journal");

        {
            let store = JournalSnapshotStore::open(&path).await.unwrap();
            let outcome = store.upsert_many(vec![row(0, 1), row(30, 2)]).await.unwrap();
            assert_eq!(outcome.inserted_count(), 2);
        }

        let reopened = JournalSnapshotStore::open(&path).await.unwrap();
        assert_eq!(reopened.len().await.unwrap(), 2);

        let rows = reopened
            .scan(&ScanRequest::closed(
                Currency::EUR,
                DimensionFilter::any(),
                t0(),
                t0() + Duration::hours(1),
            ))
            .await
            .unwrap();
        assert_eq!(rows, vec![row(0, 1), row(30, 2)]);

        // Duplicates are detected against replayed rows.
        let again = reopened.upsert_many(vec![row(0, 1)]).await.unwrap();
        assert_eq!(again.inserted_count(), 0);
        assert_eq!(again.duplicates, 1);
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.journal");

        {
            let store = JournalSnapshotStore::open(&path).await.unwrap();
            store.upsert_many(vec![row(0, 1)]).await.unwrap();
        }
        let intact_len = std::fs::metadata(&path).unwrap().len();

        // Half of a second frame.
        let mut partial = Vec::new();
        encode_frame(&row(30, 2), &mut partial).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..partial.len() / 2]).unwrap();
        drop(file);

        let reopened = JournalSnapshotStore::open(&path).await.unwrap();
        assert_eq!(reopened.len().await.unwrap(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact_len);

        reopened.upsert_many(vec![row(30, 2)]).await.unwrap();
        drop(reopened);
        let again = JournalSnapshotStore::open(&path).await.unwrap();
        assert_eq!(again.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.journal");

        {
            let store = JournalSnapshotStore::open(&path).await.unwrap();
            store.upsert_many(vec![row(0, 1)]).await.unwrap();
        }

        // Flip one payload byte.
        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let mut data = Vec::new();
        file.read_to_end(&mut data).unwrap();
        data[6] ^= 0xFF;
        file.seek(std::io::SeekFrom::Start(0)).unwrap();
        file.write_all(&data).unwrap();
        drop(file);

        let err = JournalSnapshotStore::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { offset: 0, .. }));
    }

    /// In-memory journal whose writes can be made to fail part way.
    #[derive(Default)]
    struct FlakySink {
        data: Vec<u8>,
        /// Accept this many more bytes, then fail.
        fail_after: Option<usize>,
        fail_truncate: bool,
    }

    impl Write for FlakySink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            match self.fail_after {
                Some(0) => Err(std::io::Error::other("disk full")),
                Some(n) => {
                    let take = n.min(buf.len());
                    self.data.extend_from_slice(&buf[..take]);
                    self.fail_after = Some(n - take);
                    Ok(take)
                }
                None => {
                    self.data.extend_from_slice(buf);
                    Ok(buf.len())
                }
            }
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl JournalSink for FlakySink {
        fn end_offset(&mut self) -> std::io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
            if self.fail_truncate {
                return Err(std::io::Error::other("read-only"));
            }
            self.data.truncate(len as usize);
            Ok(())
        }

        fn sync(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn frames(rows: &[PriceSnapshot]) -> Vec<u8> {
        let mut buf = Vec::new();
        for r in rows {
            encode_frame(r, &mut buf).unwrap();
        }
        buf
    }

    #[test]
    fn test_failed_append_is_rolled_back() {
        let mut sink = FlakySink::default();
        append_batch(&mut sink, &frames(&[row(0, 1)])).unwrap();
        let committed = sink.data.len();

        sink.fail_after = Some(7);
        let err = append_batch(&mut sink, &frames(&[row(30, 2)])).unwrap_err();
        assert!(matches!(err, AppendError::RolledBack(_)));
        assert_eq!(sink.data.len(), committed);

        sink.fail_after = None;
        append_batch(&mut sink, &frames(&[row(60, 3)])).unwrap();

        let replayed = replay(&sink.data).unwrap();
        assert!(!replayed.torn_tail);
        assert_eq!(replayed.rows, vec![row(0, 1), row(60, 3)]);
    }

    #[test]
    fn test_failed_rollback_is_reported() {
        let mut sink = FlakySink {
            fail_after: Some(3),
            fail_truncate: true,
            ..Default::default()
        };
        let err = append_batch(&mut sink, &frames(&[row(0, 1)])).unwrap_err();
        assert!(matches!(err, AppendError::Wedged { .. }));
    }

    #[test]
    fn test_replay_empty_image() {
        let replayed = replay(&[]).unwrap();
        assert!(replayed.rows.is_empty());
        assert!(!replayed.torn_tail);
        assert_eq!(replayed.valid_len, 0);
    }
}
