//! Container Log Source (C3, `spec.md` §4.3).
//!
//! Subscribes to the container runtime's event stream and, for every
//! running container that passes the include/exclude label/name filter,
//! opens a combined stdout/stderr log stream. Streams share a bounded
//! connection pool, rotate periodically to bound kernel-side buffer
//! retention, and reconnect with exponential backoff up to a quarantine
//! ceiling per `consecutive_failures`.

mod client;
mod wire;

use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::Arc,
    time::Duration,
};

pub use client::{
    ContainerEvent,
    ContainerEventKind,
    ContainerSummary,
    DockerRuntimeClient,
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
    runtime::SpawnHandle,
    Backoff,
    Runtime,
};
use streamship_config::ContainerMonitorConfig;
use tokio::sync::{
    mpsc,
    watch,
    Semaphore,
};

/// Reconnection attempts after which a container is quarantined until a
/// fresh `start` event reasserts it (`spec.md` §4.3).
const QUARANTINE_AFTER_FAILURES: u32 = 8;

struct TrackedContainer {
    shutdown_tx: watch::Sender<bool>,
    handle: Box<dyn SpawnHandle>,
}

pub struct ContainerLogSource<R: Runtime> {
    config: ContainerMonitorConfig,
    client: Arc<DockerRuntimeClient>,
    runtime: R,
    record_tx: mpsc::Sender<Record>,
    pool: Arc<Semaphore>,
    tracked: HashMap<String, TrackedContainer>,
    quarantined: HashSet<String>,
}

impl<R: Runtime> ContainerLogSource<R> {
    pub fn new(config: ContainerMonitorConfig, runtime: R, record_tx: mpsc::Sender<Record>) -> Self {
        let client = Arc::new(DockerRuntimeClient::new(config.socket_path.clone()));
        let pool = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            client,
            runtime,
            record_tx,
            pool,
            tracked: HashMap::new(),
            quarantined: HashSet::new(),
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    fn passes_filters(&self, summary: &ContainerSummary) -> bool {
        let name = summary.name();
        if !self.config.include_names.is_empty()
            && !self.config.include_names.iter().any(|n| n == &name)
        {
            return false;
        }
        if self.config.exclude_names.iter().any(|n| n == &name) {
            return false;
        }
        if !self.config.include_labels.is_empty()
            && !self
                .config
                .include_labels
                .iter()
                .any(|l| summary.labels.contains_key(l))
        {
            return false;
        }
        if self
            .config
            .exclude_labels
            .iter()
            .any(|l| summary.labels.contains_key(l))
        {
            return false;
        }
        true
    }

    fn reap_finished(&mut self) {
        self.tracked.retain(|_, t| !t.handle.is_finished());
    }

    fn track(&mut self, summary: ContainerSummary) {
        emit(LifecycleEvent::SourceDiscovered {
            source_key: format!("container:{}", summary.id),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let client = self.client.clone();
        let pool = self.pool.clone();
        let record_tx = self.record_tx.clone();
        let runtime = self.runtime.clone();
        let config = self.config.clone();
        let name = summary.name();
        let image = summary.image.clone();
        let id = summary.id.clone();

        let handle = self.runtime.spawn("container-log-stream", async move {
            run_container_stream(client, pool, record_tx, runtime, config, id, name, image, shutdown_rx).await;
        });

        self.tracked.insert(
            summary.id,
            TrackedContainer {
                shutdown_tx,
                handle,
            },
        );
    }

    async fn reconcile(&mut self) {
        let Ok(running) = self.client.list_running().await else {
            return;
        };
        for summary in running {
            if self.tracked.contains_key(&summary.id) || self.quarantined.contains(&summary.id) {
                continue;
            }
            if !self.passes_filters(&summary) {
                continue;
            }
            self.track(summary);
        }
    }

    fn shutdown_all(&mut self) {
        for (_, mut tracked) in self.tracked.drain() {
            let _ = tracked.shutdown_tx.send(true);
            tracked.handle.shutdown();
        }
    }

    /// Runs the reconciliation loop (periodic `list_running` + event-stream
    /// driven un-quarantine) until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            return;
        }

        let (event_tx, mut event_rx) = mpsc::channel(256);
        let event_client = self.client.clone();
        let mut event_shutdown = shutdown.clone();
        let runtime_for_events = self.runtime.clone();
        self.runtime.spawn("container-event-stream", async move {
            let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
            loop {
                if *event_shutdown.borrow() {
                    return;
                }
                if let Err(e) = event_client.stream_events(&event_tx).await {
                    tracing::warn!(error = %e, "container event stream disconnected");
                }
                let delay = backoff.fail(&mut runtime_for_events.rng());
                tokio::select! {
                    _ = runtime_for_events.wait(delay) => {},
                    _ = event_shutdown.changed() => {},
                }
            }
        });

        loop {
            if *shutdown.borrow() {
                self.shutdown_all();
                return;
            }

            self.reconcile().await;
            self.reap_finished();

            while let Ok(event) = event_rx.try_recv() {
                if event.kind == ContainerEventKind::Start {
                    self.quarantined.remove(&event.id);
                }
            }

            tokio::select! {
                _ = self.runtime.wait(self.config.reconnect_interval) => {},
                _ = shutdown.changed() => {},
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_container_stream<R: Runtime>(
    client: Arc<DockerRuntimeClient>,
    pool: Arc<Semaphore>,
    record_tx: mpsc::Sender<Record>,
    runtime: R,
    config: ContainerMonitorConfig,
    container_id: String,
    name: String,
    image: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let source_key = format!("container:{container_id}");
    let static_labels: Labels = [
        ("container_name".to_string(), name),
        ("image".to_string(), image),
        ("host".to_string(), streamship_common::hostname().to_string()),
    ]
    .into_iter()
    .collect();

    let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(60));

    loop {
        if *shutdown.borrow() {
            return;
        }
        if backoff.failures() >= QUARANTINE_AFTER_FAILURES {
            tracing::warn!(source_key = %source_key, "quarantining container after repeated stream failures");
            emit(LifecycleEvent::SourceErrored {
                source_key: source_key.clone(),
                reason: "quarantined after repeated reconnect failures".to_string(),
            });
            return;
        }

        let Ok(_permit) = pool.clone().acquire_owned().await else {
            return;
        };

        emit(LifecycleEvent::SourceActive {
            source_key: source_key.clone(),
        });

        let (frame_tx, mut frame_rx) = mpsc::channel(256);
        let stream_client = client.clone();
        let stream_id = container_id.clone();
        let stdout = config.include_stdout;
        let stderr = config.include_stderr;
        let follow = config.follow;
        let stream_task = tokio::spawn(async move {
            stream_client.stream_logs(&stream_id, stdout, stderr, follow, &frame_tx).await
        });

        let rotation_deadline = runtime.wait(config.stream_rotation_age);
        tokio::pin!(rotation_deadline);

        let mut clean_rotation = false;
        loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    match frame {
                        Some((is_stderr, payload)) => {
                            let record = Record::new(
                                runtime.unix_timestamp(),
                                payload,
                                SourceType::Container,
                                source_key.clone(),
                                static_labels.clone(),
                            ).with_fields(streamship_common::record::Fields::from_iter([(
                                "stream".to_string(),
                                streamship_common::record::FieldValue::Str(
                                    if is_stderr { "stderr" } else { "stdout" }.to_string(),
                                ),
                            )]));
                            if record_tx.send(record).await.is_err() {
                                return;
                            }
                            metrics().records_ingested_total.with_label_values(&["container"]).inc();
                        },
                        None => break,
                    }
                },
                _ = &mut rotation_deadline => {
                    clean_rotation = true;
                    break;
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        stream_task.abort();
                        return;
                    }
                },
            }
        }

        if clean_rotation {
            stream_task.abort();
            backoff.reset();
            continue;
        }

        match stream_task.await {
            Ok(Ok(())) => {
                backoff.reset();
                emit(LifecycleEvent::SourceClosed {
                    source_key: source_key.clone(),
                });
                return;
            },
            Ok(Err(e)) => {
                tracing::warn!(source_key = %source_key, error = %e, "container log stream failed");
            },
            Err(e) => {
                tracing::warn!(source_key = %source_key, error = %e, "container log stream task panicked");
            },
        }

        let delay = backoff.fail(&mut runtime.rng());
        runtime.wait(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(name: &str, labels: &[(&str, &str)]) -> ContainerSummary {
        ContainerSummary {
            id: format!("id-{name}"),
            names: vec![format!("/{name}")],
            image: "nginx".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn source(config: ContainerMonitorConfig) -> ContainerLogSource<streamship_common::runtime::testing::TestRuntime> {
        let (tx, _rx) = mpsc::channel(16);
        ContainerLogSource::new(config, streamship_common::runtime::testing::TestRuntime::new(), tx)
    }

    #[test]
    fn include_names_filter_is_exact_match() {
        let mut config = ContainerMonitorConfig::default();
        config.include_names = vec!["web".to_string()];
        let src = source(config);

        assert!(src.passes_filters(&summary("web", &[])));
        assert!(!src.passes_filters(&summary("worker", &[])));
    }

    #[test]
    fn exclude_labels_filter_rejects_matches() {
        let mut config = ContainerMonitorConfig::default();
        config.exclude_labels = vec!["streamship.ignore".to_string()];
        let src = source(config);

        assert!(!src.passes_filters(&summary("web", &[("streamship.ignore", "true")])));
        assert!(src.passes_filters(&summary("web", &[])));
    }
}
