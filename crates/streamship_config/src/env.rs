//! `SSW_`-prefixed environment variable overlay.
//!
//! `spec.md` §6: "Environment variables mirror the YAML keys with an `SSW_`
//! prefix." A fully generic nested-key deserializer is more machinery than
//! this surface needs; instead every config key reachable from an operator's
//! environment is listed explicitly below, which also makes `SSW_*` a
//! grep-able, self-documenting list instead of an implicit convention.

use std::{
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use crate::{
    BackpressurePolicy,
    Config,
    DropPolicy,
    SeekStrategy,
};

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("SSW_{name}")).ok()
}

fn parse_env<T: FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("SSW_{name}: {e}")),
        None => Ok(None),
    }
}

fn parse_duration_env(name: &str) -> anyhow::Result<Option<Duration>> {
    match env_var(name) {
        Some(raw) => humantime::parse_duration(&raw)
            .map(Some)
            .map_err(|e| anyhow::anyhow!("SSW_{name}: {e}")),
        None => Ok(None),
    }
}

pub fn apply_env_overrides(config: &mut Config) -> anyhow::Result<()> {
    if let Some(v) = parse_env::<usize>("DISPATCHER_QUEUE_SIZE")? {
        config.dispatcher.queue_size = v;
    }
    if let Some(v) = parse_env::<usize>("DISPATCHER_WORKER_COUNT")? {
        config.dispatcher.worker_count = v;
    }
    if let Some(v) = parse_env::<usize>("DISPATCHER_BATCH_SIZE")? {
        config.dispatcher.batch_size = v;
    }
    if let Some(v) = parse_duration_env("DISPATCHER_BATCH_TIMEOUT")? {
        config.dispatcher.batch_timeout = v;
    }
    if let Some(v) = parse_env::<u32>("DISPATCHER_MAX_RETRIES")? {
        config.dispatcher.max_retries = v;
    }
    if let Some(v) = parse_duration_env("DISPATCHER_INITIAL_DELAY")? {
        config.dispatcher.initial_delay = v;
    }
    if let Some(v) = parse_duration_env("DISPATCHER_MAX_DELAY")? {
        config.dispatcher.max_delay = v;
    }
    if let Some(v) = parse_env::<f64>("DISPATCHER_MULTIPLIER")? {
        config.dispatcher.multiplier = v;
    }
    if let Some(v) = parse_env::<usize>("DISPATCHER_MAX_RETRY_QUEUE_SIZE")? {
        config.dispatcher.max_retry_queue_size = v;
    }
    if let Some(raw) = env_var("DISPATCHER_DROP_POLICY") {
        config.dispatcher.drop_policy = match raw.as_str() {
            "oldest" => DropPolicy::Oldest,
            "newest" => DropPolicy::Newest,
            other => anyhow::bail!("SSW_DISPATCHER_DROP_POLICY: unknown policy `{other}`"),
        };
    }
    if let Some(raw) = env_var("DISPATCHER_BACKPRESSURE_POLICY") {
        config.dispatcher.backpressure_policy = match raw.as_str() {
            "block" => BackpressurePolicy::Block,
            "drop_newest" => BackpressurePolicy::DropNewest,
            "drop_oldest" => BackpressurePolicy::DropOldest,
            other => anyhow::bail!("SSW_DISPATCHER_BACKPRESSURE_POLICY: unknown policy `{other}`"),
        };
    }

    if let Some(raw) = env_var("FILE_MONITOR_WATCH_DIRECTORIES") {
        config.file_monitor.watch_directories =
            raw.split(',').map(PathBuf::from).collect();
    }
    if let Some(raw) = env_var("FILE_MONITOR_INCLUDE_PATTERNS") {
        config.file_monitor.include_patterns = raw.split(',').map(str::to_string).collect();
    }
    if let Some(raw) = env_var("FILE_MONITOR_EXCLUDE_PATTERNS") {
        config.file_monitor.exclude_patterns = raw.split(',').map(str::to_string).collect();
    }
    if let Some(v) = parse_duration_env("FILE_MONITOR_POLL_INTERVAL")? {
        config.file_monitor.poll_interval = v;
    }
    if let Some(v) = parse_env::<usize>("FILE_MONITOR_READ_BUFFER_SIZE")? {
        config.file_monitor.read_buffer_size = v;
    }
    if let Some(raw) = env_var("FILE_MONITOR_SEEK_STRATEGY") {
        config.file_monitor.seek_strategy = match raw.as_str() {
            "beginning" => SeekStrategy::Beginning,
            "end" => SeekStrategy::End,
            "recent_bytes" => SeekStrategy::RecentBytes,
            other => anyhow::bail!("SSW_FILE_MONITOR_SEEK_STRATEGY: unknown strategy `{other}`"),
        };
    }
    if let Some(v) = parse_env::<bool>("FILE_MONITOR_RECURSIVE")? {
        config.file_monitor.recursive = v;
    }
    if let Some(v) = parse_env::<bool>("FILE_MONITOR_FOLLOW_SYMLINKS")? {
        config.file_monitor.follow_symlinks = v;
    }
    if let Some(v) = parse_env::<usize>("FILE_MONITOR_MAX_TRACKED_FILES")? {
        config.file_monitor.max_tracked_files = v;
    }

    if let Some(raw) = env_var("CONTAINER_MONITOR_SOCKET_PATH") {
        config.container_monitor.socket_path = PathBuf::from(raw);
    }
    if let Some(v) = parse_env::<bool>("CONTAINER_MONITOR_ENABLED")? {
        config.container_monitor.enabled = v;
    }
    if let Some(v) = parse_env::<usize>("CONTAINER_MONITOR_MAX_CONCURRENT")? {
        config.container_monitor.max_concurrent = v;
    }

    if let Some(raw) = env_var("POSITIONS_DIRECTORY") {
        config.positions.directory = PathBuf::from(raw);
    }
    if let Some(v) = parse_duration_env("POSITIONS_FLUSH_INTERVAL")? {
        config.positions.flush_interval = v;
    }
    if let Some(v) = parse_env::<bool>("POSITIONS_FORCE_FLUSH_ON_EXIT")? {
        config.positions.force_flush_on_exit = v;
    }

    if let Some(raw) = env_var("DLQ_DIRECTORY") {
        config.dlq.directory = PathBuf::from(raw);
    }
    if let Some(v) = parse_env::<u64>("DLQ_MAX_BYTES")? {
        config.dlq.max_bytes = v;
    }
    if let Some(v) = parse_duration_env("DLQ_MAX_AGE")? {
        config.dlq.max_age = v;
    }

    if let Some(raw) = env_var("PIPELINE_NAME") {
        config.pipeline.name = raw;
    }
    if let Some(raw) = env_var("PIPELINE_TENANT") {
        config.pipeline.tenant = Some(raw);
    }

    Ok(())
}
