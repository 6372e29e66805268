//! Entry store implementation
//!
//! A single stream file holds the header record followed by entry frames.
//! The in-memory index maps entry numbers to file offsets and is rebuilt by
//! replaying the file on open.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use datastream_core::codec::{encode_entry_parts, entry_frame_len};
use datastream_core::{
    DEFAULT_MAX_PAYLOAD_SIZE, ENTRY_FRAME_HEADER_SIZE, Entry, EntryType, FORMAT_VERSION,
    HEADER_RECORD_SIZE, StreamHeader, StreamType, read_entry_frame,
};

use crate::error::{StorageError, StorageResult};

/// Magic marker at the start of every stream file
pub const FILE_MAGIC: &[u8; 8] = b"DATSTRM\0";

/// Size of the magic marker plus header record
pub const FILE_HEADER_SIZE: u64 = 8 + HEADER_RECORD_SIZE as u64;

/// Read handles kept open between reads
const MAX_IDLE_READERS: usize = 8;

/// Configuration for an entry store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the stream file
    pub path: PathBuf,
    /// Stream type recorded in (and checked against) the file header
    pub stream_type: StreamType,
    /// Maximum payload size accepted by `append`
    pub max_payload_size: usize,
    /// Whether to fsync entries and header on every commit
    pub sync_on_write: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./datastream/stream.bin"),
            stream_type: StreamType(1),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            sync_on_write: true,
        }
    }
}

impl StoreConfig {
    /// Create a configuration for a stream file
    pub fn new(path: impl Into<PathBuf>, stream_type: StreamType) -> Self {
        Self {
            path: path.into(),
            stream_type,
            ..Default::default()
        }
    }

    /// Set the maximum payload size
    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    /// Enable or disable fsync on commit
    pub fn with_sync_on_write(mut self, sync_on_write: bool) -> Self {
        self.sync_on_write = sync_on_write;
        self
    }
}

/// Write-side state, only touched under the writer lock
struct Writer {
    file: File,
    /// File length covering committed entries only
    committed_len: u64,
    /// Offset where the next tentative frame goes
    tail: u64,
    /// Offsets of tentatively appended frames
    tentative: Vec<u64>,
}

/// Pool of read-only handles on the stream file
///
/// Every read seeks before it reads, so a handle's position carries no
/// state between uses.
struct ReadHandles {
    path: PathBuf,
    idle: Mutex<Vec<File>>,
}

impl ReadHandles {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            idle: Mutex::new(Vec::with_capacity(MAX_IDLE_READERS)),
        }
    }

    async fn take(&self) -> StorageResult<File> {
        if let Some(file) = self.idle.lock().await.pop() {
            return Ok(file);
        }
        Ok(File::open(&self.path).await?)
    }

    async fn put_back(&self, file: File) {
        let mut idle = self.idle.lock().await;
        if idle.len() < MAX_IDLE_READERS {
            idle.push(file);
        }
    }

    async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }
}

/// Durable append-only entry store
///
/// Appends are tentative until [`commit_appended`](Self::commit_appended)
/// publishes them; [`discard_appended`](Self::discard_appended) drops them
/// without consuming entry numbers. Reads never take the writer lock and
/// only see committed entries.
pub struct EntryStore {
    config: StoreConfig,
    writer: Mutex<Writer>,
    /// Committed entry number -> file offset
    index: RwLock<Vec<u64>>,
    readers: ReadHandles,
    /// Published entry count
    total_entries: AtomicU64,
    /// Makes the next commit fail before the header is written
    #[cfg(feature = "fault-injection")]
    fail_next_commit: std::sync::atomic::AtomicBool,
}

impl EntryStore {
    /// Open (or create) the stream file and rebuild the index
    #[instrument(skip_all, fields(path = %config.path.display()))]
    pub async fn open(config: StoreConfig) -> StorageResult<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config.path)
            .await?;

        let file_len = file.metadata().await?.len();

        let header = if file_len == 0 {
            let header = StreamHeader::new(config.stream_type);
            file.write_all(FILE_MAGIC).await?;
            file.write_all(&header.to_bytes()).await?;
            file.flush().await?;
            file.sync_all().await?;
            info!(stream_type = %config.stream_type, "Created stream file");
            header
        } else {
            read_file_header(&mut file, file_len, &config).await?
        };

        let (index, committed_len) =
            replay_entries(&config.path, header.total_entries, file_len).await?;

        if file_len > committed_len {
            warn!(
                committed_len,
                discarded_bytes = file_len - committed_len,
                "Truncating uncommitted tail"
            );
            file.set_len(committed_len).await?;
            file.sync_all().await?;
        }

        info!(
            total_entries = header.total_entries,
            bytes = committed_len,
            "Entry store opened"
        );

        Ok(Self {
            total_entries: AtomicU64::new(header.total_entries),
            index: RwLock::new(index),
            readers: ReadHandles::new(config.path.clone()),
            writer: Mutex::new(Writer {
                file,
                committed_len,
                tail: committed_len,
                tentative: Vec::new(),
            }),
            config,
            #[cfg(feature = "fault-injection")]
            fail_next_commit: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Number of committed entries
    pub fn count(&self) -> u64 {
        self.total_entries.load(Ordering::Acquire)
    }

    /// Snapshot of the stream header
    pub fn header(&self) -> StreamHeader {
        StreamHeader {
            total_entries: self.count(),
            stream_type: self.config.stream_type,
            version: FORMAT_VERSION,
        }
    }

    /// Store configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Path of the stream file
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Tentatively append an entry past the committed tail
    ///
    /// Returns the number the entry will carry once committed. Numbers are
    /// assigned in call order, continuing from the committed count.
    pub async fn append(&self, entry_type: EntryType, payload: &[u8]) -> StorageResult<u64> {
        if payload.len() > self.config.max_payload_size {
            return Err(StorageError::PayloadTooLarge {
                len: payload.len(),
                max: self.config.max_payload_size,
            });
        }

        let mut writer = self.writer.lock().await;
        let number = self.count() + writer.tentative.len() as u64;

        let mut frame = BytesMut::with_capacity(entry_frame_len(payload.len()));
        encode_entry_parts(number, entry_type, payload, &mut frame);

        let offset = writer.tail;
        writer.file.seek(SeekFrom::Start(offset)).await?;
        writer.file.write_all(&frame).await?;
        writer.file.flush().await?;

        writer.tentative.push(offset);
        writer.tail = offset + frame.len() as u64;

        debug!(entry_number = number, %entry_type, len = payload.len(), "Appended tentative entry");
        Ok(number)
    }

    /// Number of tentatively appended entries
    pub async fn pending_count(&self) -> usize {
        self.writer.lock().await.tentative.len()
    }

    /// Make all tentative entries durable and visible
    ///
    /// Entries are synced before the header record is rewritten, and the
    /// published count only moves after both writes succeed. On error the
    /// caller must [`discard_appended`](Self::discard_appended).
    pub async fn commit_appended(&self) -> StorageResult<StreamHeader> {
        let mut writer = self.writer.lock().await;
        if writer.tentative.is_empty() {
            return Ok(self.header());
        }

        let header = self
            .header()
            .with_total_entries(self.count() + writer.tentative.len() as u64);

        if self.config.sync_on_write {
            writer.file.sync_data().await?;
        }
        self.check_injected_fault()?;
        write_header_record(&mut writer.file, &header).await?;
        if self.config.sync_on_write {
            writer.file.sync_data().await?;
        }

        {
            let mut index = self.index.write().await;
            index.extend(writer.tentative.drain(..));
        }
        writer.committed_len = writer.tail;
        self.total_entries
            .store(header.total_entries, Ordering::Release);

        debug!(total_entries = header.total_entries, "Committed entries");
        Ok(header)
    }

    /// Drop all tentative entries
    ///
    /// Truncates the file back to the committed length and restores the
    /// header record. Returns the number of discarded entries.
    pub async fn discard_appended(&self) -> StorageResult<usize> {
        let mut writer = self.writer.lock().await;
        let discarded = writer.tentative.len();
        writer.tentative.clear();

        let committed_len = writer.committed_len;
        writer.tail = committed_len;
        writer.file.set_len(committed_len).await?;
        write_header_record(&mut writer.file, &self.header()).await?;
        if self.config.sync_on_write {
            writer.file.sync_data().await?;
        }

        debug!(discarded, "Discarded tentative entries");
        Ok(discarded)
    }

    /// Read a committed entry
    pub async fn read(&self, entry_number: u64) -> StorageResult<Entry> {
        let total_entries = self.count();
        if entry_number >= total_entries {
            return Err(StorageError::NotFound {
                entry_number,
                total_entries,
            });
        }
        self.read_range(entry_number, entry_number + 1)
            .await?
            .pop()
            .ok_or(StorageError::NotFound {
                entry_number,
                total_entries,
            })
    }

    /// Read committed entries in `[from, to)`
    ///
    /// `to` is clamped to the committed count observed at the start of the
    /// call; entries committed meanwhile are left for the next read.
    pub async fn read_range(&self, from: u64, to: u64) -> StorageResult<Vec<Entry>> {
        let to = to.min(self.count());
        if from >= to {
            return Ok(Vec::new());
        }

        let start_offset = {
            let index = self.index.read().await;
            index.get(from as usize).copied().ok_or_else(|| {
                StorageError::corrupted(format!("index has no offset for entry {from}"))
            })?
        };

        let mut reader = BufReader::new(self.readers.take().await?);
        reader.seek(SeekFrom::Start(start_offset)).await?;

        let mut entries = Vec::with_capacity((to - from) as usize);
        for expected in from..to {
            let entry = read_entry_frame(&mut reader, u32::MAX as usize).await?;
            if entry.number != expected {
                return Err(StorageError::corrupted(format!(
                    "expected entry {expected}, found {}",
                    entry.number
                )));
            }
            entries.push(entry);
        }

        // Handles that failed above are dropped rather than reused
        self.readers.put_back(reader.into_inner()).await;
        Ok(entries)
    }

    /// Read handles waiting for reuse
    pub async fn idle_readers(&self) -> usize {
        self.readers.idle_count().await
    }

    /// Make the next [`commit_appended`](Self::commit_appended) fail with an
    /// I/O error after the entry frames are written
    #[cfg(feature = "fault-injection")]
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::Release);
    }

    fn check_injected_fault(&self) -> StorageResult<()> {
        #[cfg(feature = "fault-injection")]
        if self.fail_next_commit.swap(false, Ordering::AcqRel) {
            return Err(StorageError::Io("injected commit failure".to_string()));
        }
        Ok(())
    }

    /// Flush and sync the stream file
    pub async fn close(&self) -> StorageResult<()> {
        let mut writer = self.writer.lock().await;
        writer.file.flush().await?;
        writer.file.sync_all().await?;
        Ok(())
    }
}

impl std::fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStore")
            .field("path", &self.config.path)
            .field("total_entries", &self.count())
            .finish_non_exhaustive()
    }
}

/// Read and check the magic marker and header record
async fn read_file_header(
    file: &mut File,
    file_len: u64,
    config: &StoreConfig,
) -> StorageResult<StreamHeader> {
    if file_len < FILE_HEADER_SIZE {
        return Err(StorageError::corrupted(format!(
            "file is {file_len} bytes, shorter than its header"
        )));
    }

    let mut raw = [0u8; FILE_HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0)).await?;
    file.read_exact(&mut raw).await?;

    if &raw[..FILE_MAGIC.len()] != FILE_MAGIC {
        return Err(StorageError::InvalidMagic);
    }
    let header = StreamHeader::decode(&mut &raw[FILE_MAGIC.len()..])?;

    if header.version != FORMAT_VERSION {
        return Err(StorageError::UnsupportedVersion(header.version));
    }
    if header.stream_type != config.stream_type {
        return Err(StorageError::StreamTypeMismatch {
            expected: config.stream_type,
            found: header.stream_type,
        });
    }
    Ok(header)
}

/// Rewrite the header record in place
async fn write_header_record(file: &mut File, header: &StreamHeader) -> StorageResult<()> {
    file.seek(SeekFrom::Start(FILE_MAGIC.len() as u64)).await?;
    file.write_all(&header.to_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Walk the committed entry frames, returning their offsets and the end offset
async fn replay_entries(
    path: &Path,
    total_entries: u64,
    file_len: u64,
) -> StorageResult<(Vec<u64>, u64)> {
    let mut index = Vec::with_capacity(total_entries as usize);
    let mut offset = FILE_HEADER_SIZE;
    if total_entries == 0 {
        return Ok((index, offset));
    }

    let mut reader = BufReader::new(File::open(path).await?);
    reader.seek(SeekFrom::Start(offset)).await?;

    for expected in 0..total_entries {
        // A length field pointing past the end of the file is corruption
        let remaining = file_len
            .saturating_sub(offset)
            .saturating_sub(ENTRY_FRAME_HEADER_SIZE as u64);
        let entry = read_entry_frame(&mut reader, remaining as usize)
            .await
            .map_err(|e| {
                StorageError::corrupted(format!(
                    "header claims {total_entries} entries, entry {expected} unreadable: {e}"
                ))
            })?;
        if entry.number != expected {
            return Err(StorageError::corrupted(format!(
                "expected entry {expected}, found {}",
                entry.number
            )));
        }
        index.push(offset);
        offset += entry_frame_len(entry.len()) as u64;
    }

    info!(entries = index.len(), "Replayed stream file");
    Ok((index, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    const STREAM: StreamType = StreamType(1);

    fn test_config(dir: &TempDir) -> StoreConfig {
        StoreConfig::new(dir.path().join("stream.bin"), STREAM)
    }

    async fn create_test_store() -> (EntryStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = EntryStore::open(test_config(&temp_dir)).await.unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let (store, _temp) = create_test_store().await;
        assert_eq!(store.count(), 0);
        assert_eq!(store.header(), StreamHeader::new(STREAM));

        let len = tokio::fs::metadata(store.path()).await.unwrap().len();
        assert_eq!(len, FILE_HEADER_SIZE);
    }

    #[tokio::test]
    async fn test_append_is_invisible_until_commit() {
        let (store, _temp) = create_test_store().await;

        assert_eq!(store.append(EntryType(1), b"A").await.unwrap(), 0);
        assert_eq!(store.append(EntryType(2), b"B").await.unwrap(), 1);
        assert_eq!(store.pending_count().await, 2);
        assert_eq!(store.count(), 0);
        assert!(store.read(0).await.unwrap_err().is_not_found());

        let header = store.commit_appended().await.unwrap();
        assert_eq!(header.total_entries, 2);
        assert_eq!(store.count(), 2);
        assert_eq!(store.pending_count().await, 0);

        let entry = store.read(1).await.unwrap();
        assert_eq!(entry, Entry::new(1, EntryType(2), Bytes::from_static(b"B")));
    }

    #[tokio::test]
    async fn test_discard_does_not_consume_numbers() {
        let (store, _temp) = create_test_store().await;

        store.append(EntryType(1), b"x").await.unwrap();
        store.append(EntryType(1), b"y").await.unwrap();
        assert_eq!(store.discard_appended().await.unwrap(), 2);
        assert_eq!(store.count(), 0);

        assert_eq!(store.append(EntryType(3), b"z").await.unwrap(), 0);
        store.commit_appended().await.unwrap();
        assert_eq!(store.read(0).await.unwrap().payload, Bytes::from_static(b"z"));

        let len = tokio::fs::metadata(store.path()).await.unwrap().len();
        assert_eq!(len, FILE_HEADER_SIZE + entry_frame_len(1) as u64);
    }

    #[tokio::test]
    async fn test_read_range_clamps_to_committed() {
        let (store, _temp) = create_test_store().await;
        for i in 0..10u8 {
            store.append(EntryType(1), &[i]).await.unwrap();
        }
        store.commit_appended().await.unwrap();
        store.append(EntryType(1), b"pending").await.unwrap();

        let entries = store.read_range(7, 100).await.unwrap();
        let numbers: Vec<u64> = entries.iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![7, 8, 9]);
        assert!(store.read_range(10, 20).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_payload_limit() {
        let temp_dir = TempDir::new().unwrap();
        let store = EntryStore::open(test_config(&temp_dir).with_max_payload_size(4))
            .await
            .unwrap();

        let result = store.append(EntryType(1), b"too long").await;
        assert!(matches!(
            result,
            Err(StorageError::PayloadTooLarge { len: 8, max: 4 })
        ));
        assert_eq!(store.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_persistence_and_replay() {
        let temp_dir = TempDir::new().unwrap();

        {
            let store = EntryStore::open(test_config(&temp_dir)).await.unwrap();
            for i in 0..5u8 {
                store.append(EntryType(2), &[i; 3]).await.unwrap();
            }
            store.commit_appended().await.unwrap();
            store.close().await.unwrap();
        }

        {
            let store = EntryStore::open(test_config(&temp_dir)).await.unwrap();
            assert_eq!(store.count(), 5);
            let entry = store.read(3).await.unwrap();
            assert_eq!(entry.payload, Bytes::from_static(&[3, 3, 3]));

            // Numbering continues after reopen
            assert_eq!(store.append(EntryType(2), b"next").await.unwrap(), 5);
        }
    }

    #[tokio::test]
    async fn test_uncommitted_tail_is_truncated_on_open() {
        let temp_dir = TempDir::new().unwrap();

        {
            let store = EntryStore::open(test_config(&temp_dir)).await.unwrap();
            store.append(EntryType(1), b"kept").await.unwrap();
            store.commit_appended().await.unwrap();
            // Crash before commit: the frame is on disk but the header is not updated
            store.append(EntryType(1), b"lost").await.unwrap();
            store.close().await.unwrap();
        }

        let store = EntryStore::open(test_config(&temp_dir)).await.unwrap();
        assert_eq!(store.count(), 1);
        let len = tokio::fs::metadata(store.path()).await.unwrap().len();
        assert_eq!(len, FILE_HEADER_SIZE + entry_frame_len(4) as u64);
        assert_eq!(store.append(EntryType(1), b"new").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stream_type_mismatch_on_open() {
        let temp_dir = TempDir::new().unwrap();
        EntryStore::open(test_config(&temp_dir)).await.unwrap();

        let other = StoreConfig::new(temp_dir.path().join("stream.bin"), StreamType(9));
        let result = EntryStore::open(other).await;
        assert!(matches!(
            result,
            Err(StorageError::StreamTypeMismatch { found: STREAM, .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_magic() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("stream.bin");
        tokio::fs::write(&path, [0u8; 32]).await.unwrap();

        let result = EntryStore::open(StoreConfig::new(path, STREAM)).await;
        assert!(matches!(result, Err(StorageError::InvalidMagic)));
    }

    #[tokio::test]
    async fn test_missing_committed_entries_is_corruption() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("stream.bin");

        let mut raw = FILE_MAGIC.to_vec();
        raw.extend_from_slice(&StreamHeader::new(STREAM).with_total_entries(3).to_bytes());
        let mut frame = BytesMut::new();
        encode_entry_parts(0, EntryType(1), b"only one", &mut frame);
        raw.extend_from_slice(&frame);
        tokio::fs::write(&path, raw).await.unwrap();

        let result = EntryStore::open(StoreConfig::new(path, STREAM)).await;
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    #[tokio::test]
    async fn test_reads_reuse_handles() {
        let (store, _temp) = create_test_store().await;
        for i in 0..4u8 {
            store.append(EntryType(1), &[i]).await.unwrap();
        }
        store.commit_appended().await.unwrap();
        assert_eq!(store.idle_readers().await, 0);

        for n in 0..4 {
            assert_eq!(store.read(n).await.unwrap().payload, Bytes::from(vec![n as u8]));
        }
        assert_eq!(store.idle_readers().await, 1);

        // A reused handle still sees entries committed after it was opened
        store.append(EntryType(1), b"late").await.unwrap();
        store.commit_appended().await.unwrap();
        assert_eq!(store.read(4).await.unwrap().payload, Bytes::from_static(b"late"));

        let reads = (0..20).map(|_| store.read_range(0, 5));
        for entries in futures::future::join_all(reads).await {
            assert_eq!(entries.unwrap().len(), 5);
        }
        assert!(store.idle_readers().await <= MAX_IDLE_READERS);
    }
}
