//! Source Registry (C4, `spec.md` §4.4).
//!
//! Central authority on which files are being tailed: periodically scans the
//! configured directories, applies include/exclude globs and excluded
//! directory prefixes, enforces a per-source tracking cap, and owns the
//! lifecycle of every spawned `file_tailer::FileTailer` task.

use std::{
    collections::HashMap,
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use file_tailer::FileTailer;
use glob::Pattern;
use position_store::PositionStore;
use streamship_common::{
    events::{
        emit,
        LifecycleEvent,
    },
    record::{
        Labels,
        Record,
    },
    runtime::SpawnHandle,
    Runtime,
};
use streamship_config::FileMonitorConfig;
use tokio::sync::{
    mpsc,
    watch,
};
use walkdir::WalkDir;

struct TrackedSource {
    shutdown_tx: watch::Sender<bool>,
    handle: Box<dyn SpawnHandle>,
}

pub struct SourceRegistry<R: Runtime> {
    config: FileMonitorConfig,
    positions: Arc<PositionStore>,
    runtime: R,
    record_tx: mpsc::Sender<Record>,
    tracked: HashMap<String, TrackedSource>,
}

impl<R: Runtime> SourceRegistry<R> {
    pub fn new(
        config: FileMonitorConfig,
        positions: Arc<PositionStore>,
        runtime: R,
        record_tx: mpsc::Sender<Record>,
    ) -> Self {
        Self {
            config,
            positions,
            runtime,
            record_tx,
            tracked: HashMap::new(),
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Scans the watch directories once, spawning a tailer for every newly
    /// discovered, filter-matching file. Returns the number of newly tracked
    /// sources.
    pub fn scan_once(&mut self) -> usize {
        let candidates = discover(&self.config);
        let mut newly_tracked = 0;

        for path in candidates {
            let key = file_tailer::source_key(&path);
            if self.tracked.contains_key(&key) {
                continue;
            }
            if self.tracked.len() >= self.config.max_tracked_files {
                tracing::warn!(
                    path = %path.display(),
                    cap = self.config.max_tracked_files,
                    "max_tracked_files reached, skipping newly discovered file"
                );
                break;
            }
            self.track(path);
            newly_tracked += 1;
        }

        newly_tracked
    }

    /// Drops tracking entries whose tailer task has already finished (file
    /// drained, or rotated past recovery) so `scan_once` can rediscover the
    /// path fresh on the next pass if it reappears.
    pub fn reap_finished(&mut self) {
        self.tracked.retain(|_, tracked| !tracked.handle.is_finished());
    }

    fn track(&mut self, path: PathBuf) {
        let key = file_tailer::source_key(&path);
        emit(LifecycleEvent::SourceDiscovered {
            source_key: key.clone(),
        });

        let tailer = FileTailer::new(path, Labels::new(), &self.config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let record_tx = self.record_tx.clone();
        let positions = self.positions.clone();
        let config = self.config.clone();
        let runtime = self.runtime.clone();

        let handle = self.runtime.spawn("file-tailer", async move {
            tailer.run(record_tx, positions, config, runtime, shutdown_rx).await;
        });

        self.tracked.insert(
            key,
            TrackedSource {
                shutdown_tx,
                handle,
            },
        );
    }

    /// Signals every tracked tailer to stop and forgets them all.
    pub fn shutdown_all(&mut self) {
        for (_, mut tracked) in self.tracked.drain() {
            let _ = tracked.shutdown_tx.send(true);
            tracked.handle.shutdown();
        }
    }

    /// Runs the scan/reconcile loop until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                self.shutdown_all();
                return;
            }

            let found = self.scan_once();
            if found > 0 {
                tracing::info!(found, "source registry discovered new files");
            }
            self.reap_finished();

            tokio::select! {
                _ = self.runtime.wait(self.config.poll_interval) => {},
                _ = shutdown.changed() => {},
            }
        }
    }
}

/// Walks `config.watch_directories` (recursively if configured, following
/// symlinks if configured) and returns every path that passes the
/// include/exclude glob filters and isn't under an excluded-directory
/// prefix.
fn discover(config: &FileMonitorConfig) -> Vec<PathBuf> {
    let include: Vec<Pattern> = config
        .include_patterns
        .iter()
        .filter_map(|p| Pattern::new(p).ok())
        .collect();
    let exclude: Vec<Pattern> = config
        .exclude_patterns
        .iter()
        .filter_map(|p| Pattern::new(p).ok())
        .collect();

    let mut found = Vec::new();
    for root in &config.watch_directories {
        let mut walker = WalkDir::new(root).follow_links(config.follow_symlinks);
        if !config.recursive {
            walker = walker.max_depth(1);
        }
        for entry in walker.sort_by_file_name() {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if is_excluded_directory(path, &config.exclude_directories) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !include.iter().any(|p| p.matches(name)) {
                continue;
            }
            if exclude.iter().any(|p| p.matches(name)) {
                continue;
            }
            found.push(path.to_path_buf());
        }
    }
    found
}

fn is_excluded_directory(path: &Path, excluded: &[PathBuf]) -> bool {
    excluded.iter().any(|dir| path.starts_with(dir))
}
