use streamship_common::StreamshipError;

use crate::Config;

/// Strict validation (`spec.md` §6): unknown ports, non-absolute paths where
/// absolute is required, invalid durations, zero worker count, zero queue
/// size — all reject startup with a precise error naming the offending key.
/// Duration parsing itself is enforced by `humantime_serde` at deserialize
/// time, so this pass focuses on cross-field and range invariants.
pub fn validate(config: &Config) -> Result<(), StreamshipError> {
    let err = |key: &str, message: &str| StreamshipError::Config {
        key: key.to_string(),
        message: message.to_string(),
    };

    if config.dispatcher.queue_size == 0 {
        return Err(err("dispatcher.queue_size", "must be greater than zero"));
    }
    if config.dispatcher.worker_count == 0 {
        return Err(err("dispatcher.worker_count", "must be greater than zero"));
    }
    if config.dispatcher.batch_size == 0 {
        return Err(err("dispatcher.batch_size", "must be greater than zero"));
    }
    if config.dispatcher.multiplier <= 1.0 {
        return Err(err(
            "dispatcher.multiplier",
            "must be greater than 1.0 for backoff to grow",
        ));
    }
    if config.dispatcher.max_retry_queue_size == 0 {
        return Err(err(
            "dispatcher.max_retry_queue_size",
            "must be greater than zero",
        ));
    }

    if !config.positions.directory.is_absolute() {
        return Err(err("positions.directory", "must be an absolute path"));
    }
    if config.positions.max_memory_buffer == 0 {
        return Err(err(
            "positions.max_memory_buffer",
            "must be greater than zero",
        ));
    }

    if !config.dlq.directory.is_absolute() {
        return Err(err("dlq.directory", "must be an absolute path"));
    }
    if config.dlq.max_bytes == 0 {
        return Err(err("dlq.max_bytes", "must be greater than zero"));
    }

    if config.container_monitor.enabled && !config.container_monitor.socket_path.is_absolute() {
        return Err(err(
            "container_monitor.socket_path",
            "must be an absolute path",
        ));
    }
    if config.container_monitor.max_concurrent == 0 {
        return Err(err(
            "container_monitor.max_concurrent",
            "must be greater than zero",
        ));
    }

    for dir in &config.file_monitor.watch_directories {
        if !dir.is_absolute() {
            return Err(err(
                "file_monitor.watch_directories",
                &format!("{} must be an absolute path", dir.display()),
            ));
        }
    }
    if config.file_monitor.max_tracked_files == 0 {
        return Err(err(
            "file_monitor.max_tracked_files",
            "must be greater than zero",
        ));
    }

    let mut seen_names = std::collections::HashSet::new();
    for sink in &config.sinks {
        if sink.name.is_empty() {
            return Err(err("sinks[].name", "must not be empty"));
        }
        if !seen_names.insert(sink.name.clone()) {
            return Err(err("sinks[].name", &format!("duplicate sink name `{}`", sink.name)));
        }
        if sink.min_batch == 0 || sink.min_batch > sink.max_batch {
            return Err(err(
                "sinks[].min_batch",
                "must be nonzero and <= max_batch",
            ));
        }
        if let crate::SinkKind::Http { endpoint, .. } = &sink.kind {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(err(
                    "sinks[].kind.endpoint",
                    "http sink endpoint must start with http:// or https://",
                ));
            }
        }
        if sink.circuit_breaker.failure_threshold == 0 {
            return Err(err(
                "sinks[].circuit_breaker.failure_threshold",
                "must be greater than zero",
            ));
        }
        if sink.max_idle == 0 || sink.max_per_host == 0 || sink.max_total == 0 {
            return Err(err(
                "sinks[].max_idle",
                "max_idle, max_per_host and max_total must all be nonzero",
            ));
        }
        if sink.max_per_host > sink.max_total {
            return Err(err(
                "sinks[].max_per_host",
                "must be <= max_total",
            ));
        }
    }

    if config.dedup.enabled && config.dedup.capacity == 0 {
        return Err(err("dedup.capacity", "must be greater than zero"));
    }

    if config.pipeline.name.is_empty() {
        return Err(err("pipeline.name", "must not be empty"));
    }
    if let Some(pattern) = &config.pipeline.frame.continuation_pattern {
        if regex::Regex::new(pattern).is_err() {
            return Err(err(
                "pipeline.frame.continuation_pattern",
                &format!("not a valid regex: {pattern}"),
            ));
        }
    }
    for parser in &config.pipeline.parsers {
        if let crate::ParserConfig::Regex { pattern } = parser {
            if regex::Regex::new(pattern).is_err() {
                return Err(err(
                    "pipeline.parsers[].pattern",
                    &format!("not a valid regex: {pattern}"),
                ));
            }
        }
    }
    for filter in &config.pipeline.filters {
        if filter.field.is_empty() {
            return Err(err("pipeline.filters[].field", "must not be empty"));
        }
        if filter.op == crate::FilterOp::Matches && regex::Regex::new(&filter.value).is_err() {
            return Err(err(
                "pipeline.filters[].value",
                &format!("not a valid regex: {}", filter.value),
            ));
        }
    }
    for redaction in &config.pipeline.redactions {
        if regex::Regex::new(&redaction.pattern).is_err() {
            return Err(err(
                "pipeline.redactions[].pattern",
                &format!("not a valid regex: {}", redaction.pattern),
            ));
        }
    }

    if config.resource_monitor.enabled {
        if config.resource_monitor.sample_interval.is_zero() {
            return Err(err(
                "resource_monitor.sample_interval",
                "must be greater than zero",
            ));
        }
        if config.resource_monitor.memory_ceiling_bytes == 0 {
            return Err(err(
                "resource_monitor.memory_ceiling_bytes",
                "must be greater than zero",
            ));
        }
    }

    Ok(())
}
