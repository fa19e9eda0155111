//! Dead Letter Queue (C10, `spec.md` §4.10).
//!
//! An append-only, size- and age-bounded on-disk log of records the sink
//! layer and retry manager gave up on. Entries use the same length-prefixed,
//! CRC32-checked framing as the Position Store (`position_store::PositionStore`)
//! so a single corrupted entry never invalidates the ones before or after it;
//! unlike the position store, the log is append-only and rotates into fresh
//! segment files rather than being rewritten in full on every flush.

use std::{
    collections::VecDeque,
    fs,
    io::{
        Read,
        Write,
    },
    path::{
        Path,
        PathBuf,
    },
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use dispatcher::DispatcherQueue;
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};
use streamship_common::{
    events::{
        emit,
        LifecycleEvent,
    },
    record::{
        Fields,
        FieldValue,
        Labels,
        QueueItem,
        Record,
        SourceType,
    },
};
use streamship_config::DlqConfig;

const FORMAT_VERSION: u32 = 1;
const MAGIC: &[u8; 4] = b"SSWD";
const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".dlq";
/// Replayed entries are re-enqueued with this label set to `"true"` so
/// downstream sinks and observers can tell a reinjected record apart from
/// one that arrived through the ordinary pipeline (`spec.md` §4.10).
const REPLAY_LABEL: &str = "dlq_replay";

/// One dead-lettered record, self-describing enough to reconstruct the
/// original `Record` and to report why it ended up here.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    reason: String,
    retries: u32,
    written_at: Duration,
    timestamp: Duration,
    message: Vec<u8>,
    source_type: SourceType,
    source_id: String,
    labels: Vec<(String, String)>,
    fields: Vec<(String, FieldValue)>,
}

impl StoredEntry {
    fn from_item(item: &QueueItem, reason: &str) -> Self {
        let record = &item.record;
        Self {
            reason: reason.to_string(),
            retries: item.retries,
            written_at: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default(),
            timestamp: record.timestamp,
            message: record.message.to_vec(),
            source_type: record.source_type,
            source_id: record.source_id.to_string(),
            labels: record.labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            fields: record.fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    fn into_item(self, enqueued_at: Duration) -> QueueItem {
        let labels: Labels = self.labels.into_iter().collect();
        let labels = labels.with_extra([(REPLAY_LABEL.to_string(), "true".to_string())]);
        let fields: Fields = self.fields.into_iter().collect();
        let record =
            Record::new(self.timestamp, self.message, self.source_type, self.source_id, labels).with_fields(fields);
        QueueItem::new(record, enqueued_at)
    }
}

struct Segment {
    path: PathBuf,
    created_at: SystemTime,
}

struct State {
    closed: VecDeque<Segment>,
    active_path: PathBuf,
    active_file: fs::File,
    active_bytes: u64,
    active_created_at: SystemTime,
}

pub struct Dlq {
    directory: PathBuf,
    config: DlqConfig,
    state: Mutex<State>,
}

impl Dlq {
    /// Opens (creating if absent) the DLQ directory, discovers existing
    /// segment files, and resumes appending to the most recent one if it
    /// hasn't already hit `segment_max_bytes`.
    pub fn open(config: DlqConfig) -> anyhow::Result<Self> {
        let directory = config.directory.clone();
        fs::create_dir_all(&directory)?;

        let mut segments = discover_segments(&directory)?;
        segments.sort_by(|a, b| a.path.cmp(&b.path));

        let (active, closed) = match segments.pop() {
            Some(last) if fs::metadata(&last.path).map(|m| m.len()).unwrap_or(0) < config.segment_max_bytes => {
                (last, segments)
            },
            Some(last) => {
                segments.push(last);
                (new_segment(&directory)?, segments)
            },
            None => (new_segment(&directory)?, segments),
        };

        let active_bytes = fs::metadata(&active.path)?.len();
        let active_file = fs::OpenOptions::new().append(true).open(&active.path)?;

        let dlq = Self {
            directory,
            config,
            state: Mutex::new(State {
                closed: closed.into(),
                active_path: active.path,
                active_file,
                active_bytes,
                active_created_at: active.created_at,
            }),
        };
        dlq.prune_locked(&mut dlq.state.lock())?;
        Ok(dlq)
    }

    /// Appends `items` to the active segment (creating a fresh one first if
    /// this write would cross `segment_max_bytes`), fsyncs once for the
    /// whole batch, then enforces the size and age bounds.
    pub fn write_batch(&self, items: &[QueueItem], reason: &str) -> anyhow::Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock();
        let mut buf = Vec::new();
        for item in items {
            let entry = StoredEntry::from_item(item, reason);
            let payload = serde_json::to_vec(&entry)?;
            let crc = crc32fast::hash(&payload);
            buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            buf.extend_from_slice(&crc.to_le_bytes());
            buf.extend_from_slice(&payload);
        }

        if state.active_bytes > 0 && state.active_bytes + buf.len() as u64 > self.config.segment_max_bytes {
            self.rotate_locked(&mut state)?;
        }

        state.active_file.write_all(&buf)?;
        state.active_file.sync_all()?;
        state.active_bytes += buf.len() as u64;

        for item in items {
            emit(LifecycleEvent::RecordDeadLettered {
                source_id: item.record.source_id.to_string(),
                reason: reason.to_string(),
            });
        }

        self.prune_locked(&mut state)?;
        Ok(())
    }

    fn rotate_locked(&self, state: &mut State) -> anyhow::Result<()> {
        state.closed.push_back(Segment {
            path: state.active_path.clone(),
            created_at: state.active_created_at,
        });
        let fresh = new_segment(&self.directory)?;
        state.active_file = fs::OpenOptions::new().append(true).open(&fresh.path)?;
        state.active_path = fresh.path;
        state.active_bytes = 0;
        state.active_created_at = fresh.created_at;
        Ok(())
    }

    /// Deletes closed segments older than `max_age`, then deletes the
    /// oldest remaining closed segments while total size exceeds
    /// `max_bytes`. Never touches the active segment.
    fn prune_locked(&self, state: &mut State) -> anyhow::Result<()> {
        let now = SystemTime::now();
        while let Some(front) = state.closed.front() {
            let age = now.duration_since(front.created_at).unwrap_or_default();
            if age <= self.config.max_age {
                break;
            }
            let segment = state.closed.pop_front().unwrap();
            tracing::warn!(path = %segment.path.display(), "dropping aged-out dlq segment");
            let _ = fs::remove_file(&segment.path);
        }

        let mut total = state.active_bytes;
        for segment in &state.closed {
            total += fs::metadata(&segment.path).map(|m| m.len()).unwrap_or(0);
        }
        while total > self.config.max_bytes {
            let Some(segment) = state.closed.pop_front() else { break };
            let size = fs::metadata(&segment.path).map(|m| m.len()).unwrap_or(0);
            tracing::warn!(path = %segment.path.display(), "dropping dlq segment to stay under max_bytes");
            let _ = fs::remove_file(&segment.path);
            total = total.saturating_sub(size);
        }
        Ok(())
    }

    /// Operator-triggered reinjection: walks every segment oldest-first,
    /// skipping entries older than `max_age`, and blocking-enqueues the rest
    /// onto `queue` with `retries` reset to zero and the `dlq_replay` label
    /// set. Returns the count of records replayed and skipped.
    pub async fn replay(&self, queue: &DispatcherQueue) -> anyhow::Result<ReplayStats> {
        let paths: Vec<PathBuf> = {
            let state = self.state.lock();
            state
                .closed
                .iter()
                .map(|s| s.path.clone())
                .chain(std::iter::once(state.active_path.clone()))
                .collect()
        };

        let mut stats = ReplayStats::default();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        for path in paths {
            let entries = read_segment(&path)?;
            for entry in entries {
                if now.saturating_sub(entry.written_at) > self.config.max_age {
                    stats.skipped_aged_out += 1;
                    continue;
                }
                queue.enqueue(entry.into_item(now)).await;
                stats.replayed += 1;
            }
        }
        Ok(stats)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub replayed: u64,
    pub skipped_aged_out: u64,
}

fn new_segment(directory: &Path) -> anyhow::Result<Segment> {
    let created_at = SystemTime::now();
    let stamp = created_at
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let path = directory.join(format!("{SEGMENT_PREFIX}{stamp:020}{SEGMENT_SUFFIX}"));
    let mut file = fs::File::create(&path)?;
    file.write_all(MAGIC)?;
    file.write_all(&FORMAT_VERSION.to_le_bytes())?;
    file.sync_all()?;
    Ok(Segment { path, created_at })
}

fn discover_segments(directory: &Path) -> anyhow::Result<Vec<Segment>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        if !name.starts_with(SEGMENT_PREFIX) || !name.ends_with(SEGMENT_SUFFIX) {
            continue;
        }
        let created_at = entry.metadata()?.created().unwrap_or_else(|_| SystemTime::now());
        segments.push(Segment { path, created_at });
    }
    Ok(segments)
}

/// Reads every well-formed entry from `path`, stopping (without error) at
/// the first truncated length prefix, short payload, or CRC mismatch —
/// matching the position store's truncation tolerance (`spec.md` §4.1).
fn read_segment(path: &Path) -> anyhow::Result<Vec<StoredEntry>> {
    let mut file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    if buf.len() < 8 || &buf[0..4] != MAGIC {
        tracing::warn!(path = %path.display(), "dlq segment has bad magic, skipping");
        return Ok(Vec::new());
    }
    let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    if version != FORMAT_VERSION {
        tracing::warn!(path = %path.display(), version, "unsupported dlq segment version, skipping");
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    let mut offset = 8usize;
    while offset + 8 <= buf.len() {
        let len = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(buf[offset + 4..offset + 8].try_into().unwrap());
        offset += 8;
        if offset + len > buf.len() {
            tracing::warn!(path = %path.display(), offset, "truncated dlq record, stopping read");
            break;
        }
        let payload = &buf[offset..offset + len];
        if crc32fast::hash(payload) != crc {
            tracing::warn!(path = %path.display(), offset, "dlq record checksum mismatch, stopping read");
            break;
        }
        match serde_json::from_slice::<StoredEntry>(payload) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!(path = %path.display(), offset, "malformed dlq record: {e}");
                break;
            },
        }
        offset += len;
    }
    Ok(entries)
}
