//! Position Store (C1, `spec.md` §4.1).
//!
//! Persists `{source_key -> position}` with atomic flush (write-to-temp,
//! fsync, rename, fsync containing directory) and corruption recovery via a
//! secondary checkpoint file. The on-disk format is a versioned sequence of
//! length-prefixed, CRC32-checked records so a single corrupted record never
//! invalidates the ones before it.

use std::{
    collections::HashMap,
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

use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};
use streamship_common::events::{
    emit,
    LifecycleEvent,
};

const FORMAT_VERSION: u32 = 1;
const MAGIC: &[u8; 4] = b"SSWP";
const PRIMARY_FILE: &str = "positions.db";
const SECONDARY_FILE: &str = "positions.db.bak";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEntry {
    pub source_key: String,
    pub offset: u64,
    pub inode: u64,
    pub size: u64,
    /// Checksum of the first and last N bytes read at `offset`, used only to
    /// sanity-check that a restored position still plausibly points at the
    /// same file generation; not a full-file hash.
    pub checksum: u64,
    pub updated_at: Duration,
    pub version: u32,
}

impl PositionEntry {
    pub fn new(source_key: impl Into<String>, offset: u64, inode: u64, size: u64, checksum: u64) -> Self {
        Self {
            source_key: source_key.into(),
            offset,
            inode,
            size,
            checksum,
            updated_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default(),
            version: FORMAT_VERSION,
        }
    }
}

pub struct PositionStore {
    directory: PathBuf,
    entries: Mutex<HashMap<String, PositionEntry>>,
    dirty_count: Mutex<usize>,
}

impl PositionStore {
    /// Opens (creating if absent) the position store directory and loads any
    /// persisted entries, falling back to the secondary checkpoint, then to
    /// an empty store, on corruption — the store itself never errors out of
    /// `open`; corruption is reported through `LifecycleEvent`s (`spec.md`
    /// §4.1: "never crash the process").
    pub fn open(directory: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;

        let primary = directory.join(PRIMARY_FILE);
        let secondary = directory.join(SECONDARY_FILE);

        let entries = match read_checkpoint(&primary) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("primary position checkpoint unreadable: {e:#}");
                match read_checkpoint(&secondary) {
                    Ok(entries) => {
                        emit(LifecycleEvent::PositionCorruptionDetected {
                            source_key: "<all>".to_string(),
                        });
                        entries
                    },
                    Err(e2) => {
                        tracing::warn!("secondary position checkpoint unreadable: {e2:#}");
                        emit(LifecycleEvent::PositionCorruptionDetected {
                            source_key: "<all>".to_string(),
                        });
                        HashMap::new()
                    },
                }
            },
        };

        Ok(Self {
            directory,
            entries: Mutex::new(entries),
            dirty_count: Mutex::new(0),
        })
    }

    pub fn get(&self, source_key: &str) -> Option<PositionEntry> {
        self.entries.lock().get(source_key).cloned()
    }

    /// Updates the in-memory position. Offsets must be monotone
    /// non-decreasing for a given source except across a detected rotation
    /// (new inode) or truncation (caller passes `offset=0`); callers are
    /// responsible for detecting those transitions (`spec.md` §4.1 ordering
    /// note) — this layer only refuses to silently regress within the same
    /// inode, which would indicate a caller bug.
    pub fn update(&self, entry: PositionEntry) {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&entry.source_key) {
            if existing.inode == entry.inode && entry.offset < existing.offset {
                tracing::error!(
                    source_key = %entry.source_key,
                    existing_offset = existing.offset,
                    new_offset = entry.offset,
                    "refusing to regress position within the same inode"
                );
                return;
            }
        }
        entries.insert(entry.source_key.clone(), entry);
        drop(entries);
        *self.dirty_count.lock() += 1;
    }

    pub fn forget(&self, source_key: &str) {
        self.entries.lock().remove(source_key);
    }

    pub fn scan(&self) -> Vec<PositionEntry> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn dirty_count(&self) -> usize {
        *self.dirty_count.lock()
    }

    /// Atomically persists all entries: write to a temp file in the same
    /// directory, fsync it, rename over the primary (after rotating the
    /// previous primary to the secondary slot), then fsync the directory so
    /// the rename itself is durable.
    pub fn flush(&self) -> anyhow::Result<()> {
        let snapshot: Vec<PositionEntry> = self.entries.lock().values().cloned().collect();

        let primary = self.directory.join(PRIMARY_FILE);
        let secondary = self.directory.join(SECONDARY_FILE);
        let tmp = self.directory.join(format!("{PRIMARY_FILE}.tmp"));

        write_checkpoint(&tmp, &snapshot)?;

        if primary.exists() {
            fs::rename(&primary, &secondary)?;
        }
        fs::rename(&tmp, &primary)?;
        sync_directory(&self.directory)?;

        *self.dirty_count.lock() = 0;
        Ok(())
    }
}

fn write_checkpoint(path: &Path, entries: &[PositionEntry]) -> anyhow::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(MAGIC)?;
    file.write_all(&FORMAT_VERSION.to_le_bytes())?;
    for entry in entries {
        let payload = serde_json::to_vec(entry)?;
        let crc = crc32fast::hash(&payload);
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&crc.to_le_bytes())?;
        file.write_all(&payload)?;
    }
    file.sync_all()?;
    Ok(())
}

fn read_checkpoint(path: &Path) -> anyhow::Result<HashMap<String, PositionEntry>> {
    if !path.exists() {
        anyhow::bail!("{} does not exist", path.display());
    }
    let mut file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    if buf.len() < 8 || &buf[0..4] != MAGIC {
        anyhow::bail!("bad magic in {}", path.display());
    }
    let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    if version != FORMAT_VERSION {
        anyhow::bail!("unsupported position store version {version}");
    }

    let mut entries = HashMap::new();
    let mut offset = 8usize;
    while offset + 8 <= buf.len() {
        let len = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(buf[offset + 4..offset + 8].try_into().unwrap());
        offset += 8;
        if offset + len > buf.len() {
            tracing::warn!(
                "{}: truncated record at offset {offset}, stopping read",
                path.display()
            );
            break;
        }
        let payload = &buf[offset..offset + len];
        if crc32fast::hash(payload) != crc {
            tracing::warn!(
                "{}: checksum mismatch at offset {offset}, stopping read",
                path.display()
            );
            break;
        }
        match serde_json::from_slice::<PositionEntry>(payload) {
            Ok(entry) => {
                entries.insert(entry.source_key.clone(), entry);
            },
            Err(e) => {
                tracing::warn!("{}: malformed record at offset {offset}: {e}", path.display());
                break;
            },
        }
        offset += len;
    }

    Ok(entries)
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> anyhow::Result<()> {
    let f = fs::File::open(dir)?;
    f.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn round_trips_through_flush_and_reopen() {
        let dir = TempDir::new().unwrap();
        let store = PositionStore::open(dir.path()).unwrap();
        store.update(PositionEntry::new("file:/a#1", 100, 1, 200, 42));
        store.update(PositionEntry::new("file:/b#2", 50, 2, 50, 7));
        store.flush().unwrap();

        let reopened = PositionStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get("file:/a#1").unwrap().offset, 100);
        assert_eq!(reopened.get("file:/b#2").unwrap().offset, 50);
    }

    #[test]
    fn offsets_are_monotone_within_an_inode() {
        let dir = TempDir::new().unwrap();
        let store = PositionStore::open(dir.path()).unwrap();
        store.update(PositionEntry::new("file:/a#1", 100, 1, 200, 1));
        // Regressing within the same inode is refused.
        store.update(PositionEntry::new("file:/a#1", 10, 1, 200, 1));
        assert_eq!(store.get("file:/a#1").unwrap().offset, 100);

        // A new inode (rotation) may reset to zero.
        store.update(PositionEntry::new("file:/a#1", 0, 2, 0, 0));
        assert_eq!(store.get("file:/a#1").unwrap().inode, 2);
        assert_eq!(store.get("file:/a#1").unwrap().offset, 0);
    }

    #[test]
    fn corrupted_primary_falls_back_to_secondary() {
        let dir = TempDir::new().unwrap();
        let store = PositionStore::open(dir.path()).unwrap();
        store.update(PositionEntry::new("file:/a#1", 100, 1, 200, 1));
        store.flush().unwrap();
        // Second flush rotates this good generation into positions.db.bak.
        store.update(PositionEntry::new("file:/a#1", 150, 1, 220, 1));
        store.flush().unwrap();

        // Corrupt the primary in place.
        let primary = dir.path().join(PRIMARY_FILE);
        fs::write(&primary, b"not a valid checkpoint").unwrap();

        let reopened = PositionStore::open(dir.path()).unwrap();
        // Recovers the previous generation (offset 100) from the secondary.
        assert_eq!(reopened.get("file:/a#1").unwrap().offset, 100);
    }

    #[test]
    fn missing_store_starts_fresh_without_crashing() {
        let dir = TempDir::new().unwrap();
        let store = PositionStore::open(dir.path()).unwrap();
        assert!(store.get("file:/nope#1").is_none());
        assert!(store.scan().is_empty());
    }

    #[test]
    fn forget_removes_entry() {
        let dir = TempDir::new().unwrap();
        let store = PositionStore::open(dir.path()).unwrap();
        store.update(PositionEntry::new("file:/a#1", 100, 1, 200, 1));
        store.forget("file:/a#1");
        assert!(store.get("file:/a#1").is_none());
    }
}
