//! Directory-backed log service.
//!
//! ## File Layout
//!
//! ```text
//! {dir}/
//! ├── stream.log          # Append-only entries
//! └── stream_state.json   # Purge floor, last sequence, consumer positions
//! ```
//!
//! ## Log File Format
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Header (20 bytes)                  │
//! │ ├─ magic: u32 (0x4C53514C "LSQL") │
//! │ ├─ checksum: u32 (CRC32)          │
//! │ ├─ length: u32                     │
//! │ └─ seq: u64                        │
//! ├────────────────────────────────────┤
//! │ Payload (bincode StoredEntry)      │
//! └────────────────────────────────────┘
//! ```
//!
//! A torn or corrupt frame ends the scan on open; the file is truncated to
//! the last good frame so later appends stay readable.

use crate::shared::{CoreSubscription, StreamCore, StreamState};
use crate::{LogEntry, LogService, PublishAck, StreamInfo, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use common::{unix_millis, DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const STREAM_MAGIC: u32 = 0x4C53514C;
const HEADER_SIZE: usize = 20;
const LOG_FILE: &str = "stream.log";
const STATE_FILE: &str = "stream_state.json";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    /// Entries below this sequence have been purged.
    purged_before: u64,
    last_seq: u64,
    consumers: BTreeMap<String, u64>,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    seq: u64,
    subject: String,
    payload: Vec<u8>,
    published_ms: u64,
}

struct FrameHeader {
    magic: u32,
    checksum: u32,
    length: u32,
    seq: u64,
}

impl FrameHeader {
    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf[12..20].copy_from_slice(&self.seq.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        let mut word = [0u8; 4];
        let mut long = [0u8; 8];
        word.copy_from_slice(&buf[0..4]);
        let magic = u32::from_le_bytes(word);
        word.copy_from_slice(&buf[4..8]);
        let checksum = u32::from_le_bytes(word);
        word.copy_from_slice(&buf[8..12]);
        let length = u32::from_le_bytes(word);
        long.copy_from_slice(&buf[12..20]);
        Self {
            magic,
            checksum,
            length,
            seq: u64::from_le_bytes(long),
        }
    }
}

struct Inner {
    dir: PathBuf,
    core: Arc<StreamCore>,
    /// Serializes appends, purges and state saves.
    journal: Mutex<PersistedState>,
}

/// A durable log stored in a single directory.
#[derive(Clone)]
pub struct FileStream {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStream")
            .field("dir", &self.inner.dir)
            .field("name", &self.inner.core.name())
            .finish()
    }
}

impl FileStream {
    /// Open or create the stream stored in `dir`.
    pub fn open(dir: impl AsRef<Path>, name: impl Into<String>) -> DbResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let state_path = dir.join(STATE_FILE);
        let mut persisted: PersistedState = if state_path.exists() {
            let contents = fs::read_to_string(&state_path)?;
            serde_json::from_str(&contents).map_err(|e| {
                DbError::Storage(format!("corrupt stream state {}: {e}", state_path.display()))
            })?
        } else {
            PersistedState::default()
        };

        let entries = recover_log(&dir.join(LOG_FILE), persisted.purged_before)?;
        let scanned_last = entries.keys().next_back().copied().unwrap_or(0);
        persisted.last_seq = persisted.last_seq.max(scanned_last);

        tracing::info!(
            dir = %dir.display(),
            entries = entries.len(),
            last_seq = persisted.last_seq,
            "opened file stream"
        );

        let state = StreamState {
            entries,
            last_seq: persisted.last_seq,
            consumers: persisted.consumers.clone(),
            ..Default::default()
        };
        Ok(Self {
            inner: Arc::new(Inner {
                core: StreamCore::new(name, state),
                journal: Mutex::new(persisted),
                dir,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    fn journal(&self) -> std::sync::MutexGuard<'_, PersistedState> {
        self.inner
            .journal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn save_state(&self, state: &mut PersistedState) -> io::Result<()> {
        {
            let core = self.inner.core.lock();
            state.last_seq = core.last_seq;
            state.consumers = core.consumers.clone();
        }
        let state_path = self.inner.dir.join(STATE_FILE);
        let temp_path = self.inner.dir.join(format!("{STATE_FILE}.tmp"));
        let contents =
            serde_json::to_string_pretty(state).map_err(|e| io::Error::other(e.to_string()))?;
        fs::write(&temp_path, contents)?;
        File::open(&temp_path)?.sync_all()?;
        fs::rename(&temp_path, &state_path)?;
        File::open(&self.inner.dir)?.sync_all()?;
        Ok(())
    }

    fn append_frame(&self, entry: &LogEntry) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.inner.dir.join(LOG_FILE))?;
        {
            let mut writer = BufWriter::new(&mut file);
            write_frame(&mut writer, entry)?;
            writer.flush()?;
        }
        file.sync_data()
    }

    fn rewrite_log(&self) -> io::Result<()> {
        let log_path = self.inner.dir.join(LOG_FILE);
        let temp_path = self.inner.dir.join(format!("{LOG_FILE}.tmp"));
        let retained: Vec<LogEntry> = self.inner.core.lock().entries.values().cloned().collect();

        let mut writer = BufWriter::new(File::create(&temp_path)?);
        for entry in &retained {
            write_frame(&mut writer, entry)?;
        }
        writer.flush()?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;

        fs::rename(&temp_path, &log_path)?;
        File::open(&self.inner.dir)?.sync_all()
    }
}

fn write_frame(writer: &mut impl Write, entry: &LogEntry) -> io::Result<()> {
    let stored = StoredEntry {
        seq: entry.seq,
        subject: entry.subject.clone(),
        payload: entry.payload.to_vec(),
        published_ms: entry.published_ms,
    };
    let payload = bincode::serde::encode_to_vec(&stored, bincode::config::legacy())
        .map_err(|e| io::Error::other(e.to_string()))?;
    let length = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry too large"))?;
    let header = FrameHeader {
        magic: STREAM_MAGIC,
        checksum: crc32fast::hash(&payload),
        length,
        seq: entry.seq,
    };
    writer.write_all(&header.to_bytes())?;
    writer.write_all(&payload)
}

/// Scan the log, keep entries at or above `purged_before`, and cut off a torn tail.
fn recover_log(log_path: &Path, purged_before: u64) -> io::Result<BTreeMap<u64, LogEntry>> {
    let mut entries = BTreeMap::new();
    if !log_path.exists() {
        return Ok(entries);
    }

    let file_len = fs::metadata(log_path)?.len();
    let mut reader = BufReader::new(File::open(log_path)?);
    let mut good_len = 0u64;

    loop {
        let mut header_buf = [0u8; HEADER_SIZE];
        match reader.read_exact(&mut header_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let header = FrameHeader::from_bytes(&header_buf);
        if header.magic != STREAM_MAGIC {
            break;
        }

        let remaining = file_len.saturating_sub(good_len + HEADER_SIZE as u64);
        if u64::from(header.length) > remaining {
            break;
        }
        let mut payload = vec![0u8; header.length as usize];
        if reader.read_exact(&mut payload).is_err() {
            break;
        }
        if crc32fast::hash(&payload) != header.checksum {
            break;
        }
        let Ok((stored, _)) = bincode::serde::decode_from_slice::<StoredEntry, _>(
            &payload,
            bincode::config::legacy(),
        ) else {
            break;
        };

        good_len += HEADER_SIZE as u64 + u64::from(header.length);
        if stored.seq >= purged_before {
            entries.insert(
                stored.seq,
                LogEntry {
                    seq: stored.seq,
                    subject: stored.subject,
                    payload: Bytes::from(stored.payload),
                    published_ms: stored.published_ms,
                },
            );
        }
    }

    if good_len < file_len {
        tracing::warn!(
            path = %log_path.display(),
            kept = good_len,
            dropped = file_len - good_len,
            "truncating damaged stream log tail"
        );
        OpenOptions::new().write(true).open(log_path)?.set_len(good_len)?;
    }

    Ok(entries)
}

#[async_trait]
impl LogService for FileStream {
    fn name(&self) -> &str {
        self.inner.core.name()
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> DbResult<PublishAck> {
        let _journal = self.journal();
        let entry = LogEntry {
            seq: self.inner.core.next_seq(),
            subject: subject.to_string(),
            payload,
            published_ms: unix_millis(),
        };
        self.append_frame(&entry)
            .map_err(|e| DbError::Publish(format!("append to {}: {e}", self.dir().display())))?;
        let seq = entry.seq;
        self.inner.core.insert(entry);
        Ok(PublishAck {
            stream: self.name().to_string(),
            seq,
            duplicate: false,
        })
    }

    async fn subscribe(&self, durable: &str, start_seq: u64) -> DbResult<Box<dyn Subscription>> {
        let inner = self.inner.core.subscribe(durable, start_seq);
        Ok(Box::new(FileSubscription {
            inner,
            stream: self.clone(),
        }))
    }

    async fn purge(&self, before_seq: u64) -> DbResult<u64> {
        let mut journal = self.journal();
        if before_seq <= journal.purged_before {
            return Ok(0);
        }
        let removed = self.inner.core.purge(before_seq);
        journal.purged_before = before_seq;
        self.rewrite_log()?;
        self.save_state(&mut journal)?;
        tracing::debug!(before_seq, removed, "purged file stream");
        Ok(removed)
    }

    async fn info(&self) -> DbResult<StreamInfo> {
        Ok(self.inner.core.info())
    }
}

/// Persists the consumer's acknowledged position when drained.
struct FileSubscription {
    inner: CoreSubscription,
    stream: FileStream,
}

#[async_trait]
impl Subscription for FileSubscription {
    fn durable_name(&self) -> &str {
        self.inner.durable_name()
    }

    async fn next(&mut self) -> DbResult<LogEntry> {
        self.inner.next().await
    }

    async fn ack(&mut self, seq: u64) -> DbResult<()> {
        self.inner.ack(seq).await
    }

    async fn drain(&mut self) -> DbResult<()> {
        self.inner.drain().await?;
        let mut journal = self.stream.journal();
        self.stream.save_state(&mut journal)?;
        Ok(())
    }
}
