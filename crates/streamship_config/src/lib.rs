//! Configuration loading and validation (`spec.md` §6, `SPEC_FULL.md` §0.3).
//!
//! Merge order is: built-in `Default` → YAML file → `SSW_`-prefixed
//! environment variables → CLI flags, each layer overriding the previous.
//! Validation runs once, eagerly, after the merge; a failure there is a
//! startup error (exit code 1).

mod cli;
mod env;
mod validate;

use std::{
    path::PathBuf,
    time::Duration,
};

use serde::{
    Deserialize,
    Serialize,
};

pub use cli::Cli;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DispatcherConfig {
    pub queue_size: usize,
    pub worker_count: usize,
    pub batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub batch_timeout: Duration,
    pub backpressure_policy: BackpressurePolicy,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_retry_queue_size: usize,
    pub drop_policy: DropPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            worker_count: 4,
            batch_size: 100,
            batch_timeout: Duration::from_secs(5),
            backpressure_policy: BackpressurePolicy::Block,
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_retry_queue_size: 5_000,
            drop_policy: DropPolicy::Oldest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    Block,
    DropNewest,
    DropOldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    Oldest,
    Newest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeekStrategy {
    Beginning,
    End,
    RecentBytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileMonitorConfig {
    pub watch_directories: Vec<PathBuf>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub exclude_directories: Vec<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub read_buffer_size: usize,
    #[serde(with = "humantime_serde")]
    pub read_interval: Duration,
    pub seek_strategy: SeekStrategy,
    pub seek_recent_bytes: u64,
    pub ignore_old_timestamps: bool,
    pub recursive: bool,
    pub follow_symlinks: bool,
    pub max_line_bytes: usize,
    /// Per-source resource cap (`spec.md` §4.4): a hard ceiling on how many
    /// files the source registry will track concurrently; discovery beyond
    /// this count is logged and skipped rather than applied unbounded.
    pub max_tracked_files: usize,
}

impl Default for FileMonitorConfig {
    fn default() -> Self {
        Self {
            watch_directories: Vec::new(),
            include_patterns: vec!["*.log".to_string()],
            exclude_patterns: Vec::new(),
            exclude_directories: Vec::new(),
            poll_interval: Duration::from_secs(1),
            read_buffer_size: 64 * 1024,
            read_interval: Duration::from_millis(100),
            seek_strategy: SeekStrategy::End,
            seek_recent_bytes: 0,
            ignore_old_timestamps: false,
            recursive: true,
            follow_symlinks: false,
            max_line_bytes: 256 * 1024,
            max_tracked_files: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ContainerMonitorConfig {
    pub enabled: bool,
    pub socket_path: PathBuf,
    pub max_concurrent: usize,
    #[serde(with = "humantime_serde")]
    pub health_check_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub stream_rotation_age: Duration,
    pub include_labels: Vec<String>,
    pub exclude_labels: Vec<String>,
    pub include_names: Vec<String>,
    pub exclude_names: Vec<String>,
    pub include_stdout: bool,
    pub include_stderr: bool,
    pub follow: bool,
}

impl Default for ContainerMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socket_path: PathBuf::from("/var/run/docker.sock"),
            max_concurrent: 50,
            health_check_delay: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(1),
            stream_rotation_age: Duration::from_secs(3600),
            include_labels: Vec::new(),
            exclude_labels: Vec::new(),
            include_names: Vec::new(),
            exclude_names: Vec::new(),
            include_stdout: true,
            include_stderr: true,
            follow: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PositionsConfig {
    pub directory: PathBuf,
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    pub max_memory_buffer: usize,
    pub force_flush_on_exit: bool,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_position_age: Duration,
}

impl Default for PositionsConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/var/lib/streamship/positions"),
            flush_interval: Duration::from_secs(30),
            max_memory_buffer: 1_000,
            force_flush_on_exit: true,
            cleanup_interval: Duration::from_secs(3600),
            max_position_age: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkKind {
    Local { path: PathBuf },
    Http { endpoint: String, headers: Vec<(String, String)>, bearer_token: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub required: bool,
    pub kind: SinkKind,
    #[serde(default = "default_sink_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_sink_batch_timeout", with = "humantime_serde")]
    pub batch_timeout: Duration,
    #[serde(default = "default_sink_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default = "default_min_batch")]
    pub min_batch: usize,
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    /// Hard ceiling on idle connections kept open by this sink's pool
    /// (`spec.md` §4.9: "limits are enforced, not advisory").
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    #[serde(default = "default_max_per_host")]
    pub max_per_host: usize,
    #[serde(default = "default_max_total")]
    pub max_total: usize,
}

fn default_sink_batch_size() -> usize {
    100
}
fn default_sink_batch_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_sink_timeout() -> Duration {
    Duration::from_secs(120)
}
fn default_min_batch() -> usize {
    10
}
fn default_max_batch() -> usize {
    1_000
}
fn default_max_idle() -> usize {
    10
}
fn default_max_per_host() -> usize {
    10
}
fn default_max_total() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DlqConfig {
    pub directory: PathBuf,
    pub max_bytes: u64,
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    pub segment_max_bytes: u64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/var/lib/streamship/dlq"),
            max_bytes: 1024 * 1024 * 1024,
            max_age: Duration::from_secs(7 * 24 * 3600),
            segment_max_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DedupConfig {
    pub enabled: bool,
    pub capacity: u64,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 100_000,
            ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FrameConfig {
    pub enabled: bool,
    /// A line matching this pattern is appended to the previous line instead
    /// of starting a new record (e.g. a stack-trace continuation indented
    /// under its header line).
    pub continuation_pattern: Option<String>,
    pub max_lines: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            continuation_pattern: None,
            max_lines: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParserConfig {
    Regex { pattern: String },
    KeyValue { pair_separator: String, kv_separator: String },
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Equals,
    NotEquals,
    Contains,
    Matches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterAction {
    Drop,
    Keep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterRule {
    pub field: String,
    pub op: FilterOp,
    pub value: String,
    pub action: FilterAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedactionRule {
    pub pattern: String,
    pub replacement: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineConfig {
    pub name: String,
    pub tenant: Option<String>,
    pub frame: FrameConfig,
    pub parsers: Vec<ParserConfig>,
    pub enrich_labels: std::collections::BTreeMap<String, String>,
    pub filters: Vec<FilterRule>,
    pub redactions: Vec<RedactionRule>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            tenant: None,
            frame: FrameConfig::default(),
            parsers: Vec::new(),
            enrich_labels: std::collections::BTreeMap::new(),
            filters: Vec::new(),
            redactions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ResourceMonitorConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    pub thread_delta_threshold: i64,
    pub fd_delta_threshold: i64,
    pub memory_ceiling_bytes: u64,
    #[serde(with = "humantime_serde")]
    pub alert_cooldown: Duration,
}

impl Default for ResourceMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval: Duration::from_secs(15),
            thread_delta_threshold: 50,
            fd_delta_threshold: 200,
            memory_ceiling_bytes: 2 * 1024 * 1024 * 1024,
            alert_cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub dispatcher: DispatcherConfig,
    pub file_monitor: FileMonitorConfig,
    pub container_monitor: ContainerMonitorConfig,
    pub positions: PositionsConfig,
    pub pipeline: PipelineConfig,
    pub sinks: Vec<SinkConfig>,
    pub dlq: DlqConfig,
    pub dedup: DedupConfig,
    pub resource_monitor: ResourceMonitorConfig,
    #[serde(with = "humantime_serde")]
    pub shutdown_deadline: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            file_monitor: FileMonitorConfig::default(),
            container_monitor: ContainerMonitorConfig::default(),
            positions: PositionsConfig::default(),
            pipeline: PipelineConfig::default(),
            sinks: Vec::new(),
            dlq: DlqConfig::default(),
            dedup: DedupConfig::default(),
            resource_monitor: ResourceMonitorConfig::default(),
            shutdown_deadline: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Loads and merges configuration: defaults → YAML file (if given) →
    /// `SSW_`-prefixed env vars → CLI overrides, then validates.
    pub fn load(cli: &Cli) -> anyhow::Result<Config> {
        let mut config = Config::default();

        if let Some(path) = &cli.config {
            let text = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
            config = serde_yaml::from_str(&text)
                .map_err(|e| anyhow::anyhow!("parsing config file {}: {e}", path.display()))?;
        }

        env::apply_env_overrides(&mut config)?;
        cli::apply_cli_overrides(&mut config, cli);

        validate::validate(&config).map_err(anyhow::Error::from)?;
        Ok(config)
    }
}

pub use validate::validate;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = Config::default();
        assert!(validate::validate(&config).is_ok());
    }

    #[test]
    fn yaml_overrides_defaults() {
        let yaml = r#"
dispatcher:
  queue_size: 42
  worker_count: 2
  batch_size: 100
  batch_timeout: 5s
  backpressure_policy: block
  max_retries: 5
  initial_delay: 500ms
  max_delay: 60s
  multiplier: 2.0
  max_retry_queue_size: 5000
  drop_policy: oldest
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.dispatcher.queue_size, 42);
        assert_eq!(config.dispatcher.worker_count, 2);
        // Untouched sections keep their Default impl's values via #[serde(default)].
        assert_eq!(config.positions.flush_interval, Duration::from_secs(30));
    }

    #[test]
    fn zero_worker_count_rejected() {
        let mut config = Config::default();
        config.dispatcher.worker_count = 0;
        assert!(validate::validate(&config).is_err());
    }

    #[test]
    fn zero_queue_size_rejected() {
        let mut config = Config::default();
        config.dispatcher.queue_size = 0;
        assert!(validate::validate(&config).is_err());
    }

    #[test]
    fn relative_position_directory_rejected() {
        let mut config = Config::default();
        config.positions.directory = PathBuf::from("relative/path");
        assert!(validate::validate(&config).is_err());
    }

    #[test]
    fn unknown_yaml_key_is_rejected() {
        let yaml = "dispatcher:\n  queeu_size: 1\n";
        let result: Result<Config, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }
}
