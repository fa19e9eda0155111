//! File Tailer (C2, `spec.md` §4.2).
//!
//! Tracks a single file's read position across rotation and truncation and
//! emits complete records to the pipeline/dispatcher channel. Discovery and
//! filtering of *which* files to tail belongs to the source registry (C4);
//! this crate only drives the per-file state machine once handed a path.

mod state;

use std::{
    os::unix::fs::MetadataExt,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use position_store::{
    PositionEntry,
    PositionStore,
};
use streamship_common::{
    events::{
        emit,
        LifecycleEvent,
    },
    metrics::metrics,
    record::{
        Labels,
        Record,
        SourceType,
    },
    Backoff,
    Runtime,
};
use streamship_config::{
    FileMonitorConfig,
    SeekStrategy,
};
use tokio::{
    io::{
        AsyncReadExt,
        AsyncSeekExt,
    },
    sync::{
        mpsc,
        watch,
    },
};

pub use state::FileState;

/// One line/record worth of carry buffer, bounded by `max_line_bytes`
/// (`spec.md` §4.2: "if exceeded, emit a truncated record").
struct CarryBuffer {
    bytes: Vec<u8>,
    limit: usize,
}

impl CarryBuffer {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
        }
    }

    /// Appends `chunk`, splits out every complete newline-delimited record,
    /// and keeps any trailing partial record in the buffer. Returns the
    /// complete records in order, each paired with whether it was forcibly
    /// truncated for exceeding `limit`.
    fn push(&mut self, chunk: &[u8]) -> Vec<(Vec<u8>, bool)> {
        self.bytes.extend_from_slice(chunk);
        let mut out = Vec::new();

        loop {
            let Some(nl) = self.bytes.iter().position(|&b| b == b'\n') else {
                break;
            };
            let mut line: Vec<u8> = self.bytes.drain(..=nl).collect();
            line.pop(); // drop the newline itself
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            out.push((line, false));
        }

        if self.bytes.len() > self.limit {
            let truncated = std::mem::take(&mut self.bytes);
            out.push((truncated, true));
        }

        out
    }
}

/// Identity of a tracked file, independent of the `FileTailer`'s runtime
/// state — stable across the lifetime of the source registry's tracking
/// entry so it can be used as a map key and position-store `source_key`.
pub fn source_key(path: &std::path::Path) -> String {
    format!("file:{}", path.display())
}

pub struct FileTailer {
    path: PathBuf,
    source_key: String,
    static_labels: Labels,
    state: FileState,
    inode: u64,
    offset: u64,
    size: u64,
    carry: CarryBuffer,
    file: Option<tokio::fs::File>,
}

impl FileTailer {
    /// Creates a tailer for `path` in the `Discovered` state. Static labels
    /// (`path`, `host`, any operator-configured statics) are attached to
    /// every record emitted for this file.
    pub fn new(path: PathBuf, extra_labels: Labels, config: &FileMonitorConfig) -> Self {
        let source_key = source_key(&path);
        let static_labels = extra_labels.with_extra([
            ("path".to_string(), path.display().to_string()),
            ("host".to_string(), streamship_common::hostname().to_string()),
        ]);
        Self {
            path,
            source_key,
            static_labels,
            state: FileState::Discovered,
            inode: 0,
            offset: 0,
            size: 0,
            carry: CarryBuffer::new(config.max_line_bytes),
            file: None,
        }
    }

    pub fn source_key(&self) -> &str {
        &self.source_key
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    /// Drives the state machine until the file is drained (removed) or
    /// `shutdown` fires. Complete records are sent on `record_tx`, which may
    /// block under backpressure per `spec.md` §5 — that is the intended
    /// mechanism, not a bug.
    pub async fn run<R: Runtime>(
        mut self,
        record_tx: mpsc::Sender<Record>,
        positions: Arc<PositionStore>,
        config: FileMonitorConfig,
        runtime: R,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));

        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.state {
                FileState::Discovered => match self.open_and_seek(&positions, &config).await {
                    Ok(()) => {
                        self.state = FileState::Opened;
                        emit(LifecycleEvent::SourceActive {
                            source_key: self.source_key.clone(),
                        });
                    },
                    Err(e) => {
                        tracing::warn!(source_key = %self.source_key, error = %e, "failed to open tailed file");
                        self.state = FileState::Errored;
                    },
                },
                FileState::Opened => {
                    self.state = FileState::Reading;
                },
                FileState::Reading => match self
                    .read_once(&record_tx, &positions, config.read_buffer_size, &runtime)
                    .await
                {
                    Ok(transition) => self.state = transition,
                    Err(e) => {
                        tracing::warn!(source_key = %self.source_key, error = %e, "read error on tailed file");
                        self.state = FileState::Errored;
                    },
                },
                FileState::Idle => {
                    tokio::select! {
                        _ = runtime.wait(config.poll_interval) => {},
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                    match self.check_rotation_or_truncation().await {
                        Ok(Some(next)) => self.state = next,
                        Ok(None) => self.state = FileState::Reading,
                        Err(e) => {
                            tracing::warn!(source_key = %self.source_key, error = %e, "stat failed while idle");
                            self.state = FileState::Drained;
                        },
                    }
                },
                FileState::Rotated => {
                    emit(LifecycleEvent::SourceRotated {
                        source_key: self.source_key.clone(),
                        old_inode: self.inode,
                        new_inode: 0,
                    });
                    self.file = None;
                    self.offset = 0;
                    self.state = FileState::Discovered;
                },
                FileState::Truncated => {
                    emit(LifecycleEvent::SourceTruncated {
                        source_key: self.source_key.clone(),
                    });
                    self.offset = 0;
                    self.size = 0;
                    if let Some(file) = self.file.as_mut() {
                        let _ = file.seek(std::io::SeekFrom::Start(0)).await;
                    }
                    self.state = FileState::Opened;
                },
                FileState::Drained => {
                    emit(LifecycleEvent::SourceClosed {
                        source_key: self.source_key.clone(),
                    });
                    let _ = positions.flush();
                    return;
                },
                FileState::Errored => {
                    let delay = backoff.fail(&mut runtime.rng());
                    runtime.wait(delay).await;
                    self.state = FileState::Discovered;
                },
            }
        }
    }

    async fn open_and_seek(&mut self, positions: &PositionStore, config: &FileMonitorConfig) -> anyhow::Result<()> {
        let meta = std::fs::metadata(&self.path).context("stat")?;
        self.inode = meta.ino();
        let size = meta.size();

        let restored = positions.get(&self.source_key);
        let start_offset = match &restored {
            Some(entry) if entry.inode == self.inode => entry.offset.min(size),
            _ => match config.seek_strategy {
                SeekStrategy::Beginning => 0,
                SeekStrategy::End => size,
                SeekStrategy::RecentBytes => size.saturating_sub(config.seek_recent_bytes),
            },
        };

        let mut file = tokio::fs::File::open(&self.path).await.context("open")?;
        file.seek(std::io::SeekFrom::Start(start_offset)).await?;
        self.file = Some(file);
        self.offset = start_offset;
        self.size = size;
        Ok(())
    }

    async fn read_once<R: Runtime>(
        &mut self,
        record_tx: &mpsc::Sender<Record>,
        positions: &PositionStore,
        read_buffer_size: usize,
        runtime: &R,
    ) -> anyhow::Result<FileState> {
        let Some(file) = self.file.as_mut() else {
            anyhow::bail!("read_once called without an open file handle");
        };

        let mut buf = vec![0u8; read_buffer_size];
        let n = file.read(&mut buf).await.context("read")?;
        if n == 0 {
            return self.check_rotation_or_truncation().await.map(|t| t.unwrap_or(FileState::Idle));
        }

        for (line, truncated) in self.carry.push(&buf[..n]) {
            self.offset += line.len() as u64 + 1;
            let mut record = Record::new(
                runtime.unix_timestamp(),
                line,
                SourceType::File,
                self.source_key.clone(),
                self.static_labels.clone(),
            );
            if truncated {
                record = record.with_fields(streamship_common::record::Fields::from_iter([(
                    "truncated".to_string(),
                    streamship_common::record::FieldValue::Bool(true),
                )]));
            }
            if record_tx.send(record).await.is_err() {
                anyhow::bail!("record channel closed");
            }
            metrics().records_ingested_total.with_label_values(&["file"]).inc();
        }

        self.size = self.size.max(self.offset);
        positions.update(PositionEntry::new(
            self.source_key.clone(),
            self.offset,
            self.inode,
            self.size,
            0,
        ));

        Ok(FileState::Reading)
    }

    /// Returns `Some(next_state)` if a rotation/truncation/removal was
    /// detected, or `None` to keep reading as-is.
    async fn check_rotation_or_truncation(&mut self) -> anyhow::Result<Option<FileState>> {
        let meta = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(_) => return Ok(Some(FileState::Drained)),
        };
        if meta.ino() != self.inode {
            return Ok(Some(FileState::Rotated));
        }
        if meta.size() < self.offset {
            return Ok(Some(FileState::Truncated));
        }
        self.size = meta.size();
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use streamship_common::runtime::testing::TestRuntime;
    use tempfile::TempDir;

    use super::*;

    fn test_config(dir: &std::path::Path) -> FileMonitorConfig {
        let mut config = FileMonitorConfig::default();
        config.watch_directories = vec![dir.to_path_buf()];
        config.poll_interval = Duration::from_millis(10);
        config.seek_strategy = SeekStrategy::Beginning;
        config
    }

    #[tokio::test]
    async fn carry_buffer_splits_on_newline_and_keeps_partial() {
        let mut carry = CarryBuffer::new(1024);
        let lines = carry.push(b"hello\nworld\npartial");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, b"hello");
        assert_eq!(lines[1].0, b"world");
        assert_eq!(carry.bytes, b"partial");
    }

    #[tokio::test]
    async fn carry_buffer_emits_truncated_when_over_limit() {
        let mut carry = CarryBuffer::new(4);
        let lines = carry.push(b"toolong");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].1);
    }

    #[tokio::test]
    async fn tails_a_file_from_beginning_and_emits_records() {
        let dir = TempDir::new().unwrap();
        let file_path = dir.path().join("a.log");
        {
            let mut f = std::fs::File::create(&file_path).unwrap();
            writeln!(f, "line one").unwrap();
            writeln!(f, "line two").unwrap();
        }

        let positions = Arc::new(PositionStore::open(dir.path().join("positions")).unwrap());
        let config = test_config(dir.path());
        let tailer = FileTailer::new(file_path.clone(), Labels::new(), &config);

        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runtime = TestRuntime::new();

        let handle = tokio::spawn(tailer.run(tx, positions.clone(), config, runtime, shutdown_rx));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.message_str().as_ref(), "line one");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.message_str().as_ref(), "line two");

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }
}
