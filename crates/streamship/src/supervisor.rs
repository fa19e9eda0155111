//! Wires C1-C12 into the running agent (`spec.md` §5, `SPEC_FULL.md` §5).
//! Every long-running activity gets its own `tokio::task` and a clone of one
//! `watch<bool>` shutdown signal. On ctrl-c: stop the discovery producers
//! (source registry, container source) by letting their own `shutdown`
//! branches fire, drain the dispatcher queue up to `shutdown_deadline`, let
//! in-flight sink sends finish or hit their own deadline, then flush the
//! position store.

use std::sync::Arc;

use container_source::ContainerLogSource;
use dispatcher::{
    spawn_workers,
    DispatcherQueue,
};
use dlq::Dlq;
use pipeline::Pipeline;
use position_store::PositionStore;
use resource_monitor::ResourceMonitor;
use retry_manager::RetryManager;
use sinks::{
    DispatchOutcome,
    HttpSink,
    LocalFileSink,
    Sink,
    SinkHandle,
    SinkRouter,
};
use source_registry::SourceRegistry;
use streamship_common::{
    record::QueueItem,
    runtime::TokioRuntime,
    Runtime,
};
use streamship_config::{
    Config,
    SinkKind,
};
use tokio::sync::{
    mpsc,
    watch,
};

pub async fn run(config: Config) -> anyhow::Result<()> {
    let runtime = TokioRuntime;
    let shutdown_deadline = config.shutdown_deadline;
    let force_flush_on_exit = config.positions.force_flush_on_exit;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let positions = Arc::new(PositionStore::open(config.positions.directory.clone())?);
    let dlq = Arc::new(Dlq::open(config.dlq.clone())?);
    let queue = Arc::new(DispatcherQueue::new(
        config.dispatcher.queue_size,
        config.dispatcher.backpressure_policy,
    ));
    let router = Arc::new(build_router(&config)?);

    let (record_tx, record_rx) = mpsc::channel(1024);
    let (processed_tx, processed_rx) = mpsc::channel(1024);
    let (collected_tx, collected_rx) = mpsc::channel(config.dispatcher.worker_count.max(1));
    let (failed_tx, failed_rx) = mpsc::channel(256);

    let mut handles = Vec::new();

    let registry = SourceRegistry::new(
        config.file_monitor.clone(),
        positions.clone(),
        runtime.clone(),
        record_tx.clone(),
    );
    handles.push(tokio::spawn(registry.run(shutdown_rx.clone())));

    let container_source = ContainerLogSource::new(
        config.container_monitor.clone(),
        runtime.clone(),
        record_tx.clone(),
    );
    handles.push(tokio::spawn(container_source.run(shutdown_rx.clone())));

    // Only the two discovery producers above hold a clone; dropping the
    // original lets `record_rx` close once both of their tasks exit.
    drop(record_tx);

    let pipeline = Pipeline::new(&config.pipeline, &config.dedup)?;
    handles.push(tokio::spawn(pipeline.run(record_rx, processed_tx, shutdown_rx.clone())));
    handles.push(tokio::spawn(enqueue_loop(runtime.clone(), queue.clone(), processed_rx)));

    handles.push(tokio::spawn(spawn_workers(
        queue.clone(),
        config.dispatcher.worker_count,
        config.dispatcher.batch_size,
        config.dispatcher.batch_timeout,
        runtime.clone(),
        collected_tx,
        shutdown_rx.clone(),
    )));

    let retry_manager = Arc::new(RetryManager::new(
        queue.clone(),
        dlq.clone(),
        config.dispatcher.clone(),
        runtime.clone(),
    ));
    handles.push(tokio::spawn(run_retry_manager(retry_manager, failed_rx, shutdown_rx.clone())));

    handles.push(tokio::spawn(dispatch_loop(router, collected_rx, failed_tx)));

    let monitor = Arc::new(ResourceMonitor::new(config.resource_monitor.clone(), runtime.clone()));
    handles.push(tokio::spawn(run_resource_monitor(monitor, shutdown_rx.clone())));

    handles.push(tokio::spawn(flush_loop(
        positions.clone(),
        runtime.clone(),
        config.positions.flush_interval,
        shutdown_rx.clone(),
    )));

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(shutdown_deadline, futures::future::join_all(handles))
        .await
        .is_err()
    {
        tracing::warn!(?shutdown_deadline, "not every task drained before the shutdown deadline");
    }

    if force_flush_on_exit {
        positions.flush()?;
    }

    Ok(())
}

async fn enqueue_loop<R: Runtime>(
    runtime: R,
    queue: Arc<DispatcherQueue>,
    mut processed_rx: mpsc::Receiver<streamship_common::Record>,
) {
    while let Some(record) = processed_rx.recv().await {
        queue.enqueue(QueueItem::new(record, runtime.unix_timestamp())).await;
    }
}

async fn dispatch_loop(
    router: Arc<SinkRouter>,
    mut collected_rx: mpsc::Receiver<dispatcher::CollectedBatch>,
    failed_tx: mpsc::Sender<retry_manager::FailedBatch>,
) {
    while let Some(batch) = collected_rx.recv().await {
        match router.dispatch(batch.records).await {
            DispatchOutcome::Delivered => {},
            DispatchOutcome::Failed(failed) => {
                if failed_tx.send(failed).await.is_err() {
                    return;
                }
            },
        }
    }
}

async fn run_retry_manager<R: Runtime>(
    retry_manager: Arc<RetryManager<R>>,
    failed_rx: mpsc::Receiver<retry_manager::FailedBatch>,
    shutdown: watch::Receiver<bool>,
) {
    retry_manager.run(failed_rx, shutdown).await;
}

async fn run_resource_monitor<R: Runtime>(monitor: Arc<ResourceMonitor<R>>, shutdown: watch::Receiver<bool>) {
    monitor.run(shutdown).await;
}

async fn flush_loop<R: Runtime>(
    positions: Arc<PositionStore>,
    runtime: R,
    flush_interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let timer = runtime.wait(flush_interval);
        tokio::pin!(timer);
        tokio::select! {
            _ = &mut timer => {
                if let Err(e) = positions.flush() {
                    tracing::error!(error = %e, "position store flush failed");
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            },
        }
    }
}

fn build_router(config: &Config) -> anyhow::Result<SinkRouter> {
    let mut handles = Vec::new();
    for sink_config in &config.sinks {
        if !sink_config.enabled {
            continue;
        }
        let sink: Arc<dyn Sink> = match &sink_config.kind {
            SinkKind::Local { path } => Arc::new(LocalFileSink::new(sink_config.name.clone(), path.clone())),
            SinkKind::Http {
                endpoint,
                headers,
                bearer_token,
            } => Arc::new(HttpSink::new(
                sink_config.name.clone(),
                endpoint.clone(),
                headers,
                bearer_token.as_deref(),
                sink_config,
            )?),
        };
        handles.push(SinkHandle::new(sink, sink_config));
    }
    Ok(SinkRouter::new(handles))
}
