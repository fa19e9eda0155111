//! Leak/Resource Monitor (C12, `spec.md` §4.12).
//!
//! Samples thread count, open file descriptors and resident memory at a
//! fixed interval, compares them against a baseline captured on the first
//! sample, and raises a cooldown-gated alert when a delta crosses its
//! configured threshold or memory crosses the absolute ceiling. The monitor
//! only ever reads `/proc` and calls `getrusage`; a failed or slow sample
//! is logged and skipped, never allowed to block the data path, matching
//! the "never blocks" invariant in `spec.md` §4.12.

use std::{
    collections::HashMap,
    time::{
        Duration,
        Instant,
    },
};

use parking_lot::Mutex;
use streamship_common::{
    metrics::metrics,
    Runtime,
};
use streamship_config::ResourceMonitorConfig;
use tokio::sync::watch;

/// One point-in-time reading. `threads` and `fds` are `None` on platforms
/// without a `/proc` filesystem; memory is always available via `getrusage`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sample {
    pub threads: Option<i64>,
    pub fds: Option<i64>,
    pub memory_bytes: u64,
}

pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> anyhow::Result<Sample>;
}

/// Reads `/proc/self/status` for thread count and resident memory, and
/// counts entries under `/proc/self/fd` for descriptor count, mirroring
/// the teacher's own `libc::gethostname` use
/// (`streamship_common::host::hostname`) for talking to the OS directly
/// rather than through a higher-level sysinfo crate.
#[derive(Default)]
pub struct ProcfsSampler;

impl ResourceSampler for ProcfsSampler {
    fn sample(&self) -> anyhow::Result<Sample> {
        Ok(Sample {
            threads: read_proc_status_field("Threads:"),
            fds: count_open_fds(),
            memory_bytes: resident_memory_bytes(),
        })
    }
}

#[cfg(target_os = "linux")]
fn read_proc_status_field(label: &str) -> Option<i64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status.lines().find_map(|line| {
        let rest = line.strip_prefix(label)?;
        rest.split_whitespace().next()?.parse::<i64>().ok()
    })
}

#[cfg(not(target_os = "linux"))]
fn read_proc_status_field(_label: &str) -> Option<i64> {
    None
}

#[cfg(target_os = "linux")]
fn count_open_fds() -> Option<i64> {
    std::fs::read_dir("/proc/self/fd").ok().map(|entries| entries.count() as i64)
}

#[cfg(not(target_os = "linux"))]
fn count_open_fds() -> Option<i64> {
    None
}

/// Peak resident set size via `getrusage(2)`, the one memory figure
/// available on every unix without parsing `/proc`. It never decreases
/// within a process lifetime, which is the right shape for leak detection:
/// a real leak drives it monotonically up past the configured ceiling.
fn resident_memory_bytes() -> u64 {
    #[cfg(unix)]
    {
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        // SAFETY: `usage` is a valid, zeroed `rusage` the kernel writes into.
        let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
        if rc != 0 {
            return 0;
        }
        // Linux reports ru_maxrss in KiB; other BSD-derived unixes in bytes.
        #[cfg(target_os = "linux")]
        return (usage.ru_maxrss as u64).saturating_mul(1024);
        #[cfg(not(target_os = "linux"))]
        return usage.ru_maxrss as u64;
    }
    #[cfg(not(unix))]
    {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AlertKind {
    Threads,
    FileDescriptors,
    Memory,
}

impl AlertKind {
    fn as_str(self) -> &'static str {
        match self {
            AlertKind::Threads => "threads",
            AlertKind::FileDescriptors => "file_descriptors",
            AlertKind::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    threads: i64,
    fds: i64,
}

pub struct ResourceMonitor<R: Runtime> {
    config: ResourceMonitorConfig,
    runtime: R,
    sampler: Box<dyn ResourceSampler>,
    baseline: Mutex<Option<Baseline>>,
    last_alert: Mutex<HashMap<AlertKind, Instant>>,
}

impl<R: Runtime> ResourceMonitor<R> {
    pub fn new(config: ResourceMonitorConfig, runtime: R) -> Self {
        Self::with_sampler(config, runtime, Box::new(ProcfsSampler))
    }

    pub fn with_sampler(config: ResourceMonitorConfig, runtime: R, sampler: Box<dyn ResourceSampler>) -> Self {
        Self {
            config,
            runtime,
            sampler,
            baseline: Mutex::new(None),
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    /// Drives the sample loop until `shutdown` fires. A disabled monitor
    /// returns immediately so it costs nothing to spawn unconditionally.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            return;
        }
        loop {
            let timer = self.runtime.wait(self.config.sample_interval);
            tokio::pin!(timer);
            tokio::select! {
                _ = &mut timer => {},
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                },
            }
            self.tick();
        }
    }

    fn tick(&self) {
        match self.sampler.sample() {
            Ok(sample) => self.observe(sample),
            Err(e) => tracing::warn!(error = %e, "resource monitor failed to sample"),
        }
    }

    /// The testable unit: given one sample, updates the baseline (on first
    /// call) and raises any alerts the sample crosses.
    pub fn observe(&self, sample: Sample) {
        if let Some(memory_alert) = self.check_memory(sample.memory_bytes) {
            self.raise(AlertKind::Memory, memory_alert);
        }

        let Some(threads) = sample.threads else { return };
        let Some(fds) = sample.fds else { return };

        let mut baseline = self.baseline.lock();
        let base = match *baseline {
            Some(base) => base,
            None => {
                *baseline = Some(Baseline { threads, fds });
                return;
            },
        };
        drop(baseline);

        let thread_delta = threads - base.threads;
        if thread_delta > self.config.thread_delta_threshold {
            self.raise(
                AlertKind::Threads,
                format!("threads={threads} baseline={} delta={thread_delta}", base.threads),
            );
        }

        let fd_delta = fds - base.fds;
        if fd_delta > self.config.fd_delta_threshold {
            self.raise(
                AlertKind::FileDescriptors,
                format!("fds={fds} baseline={} delta={fd_delta}", base.fds),
            );
        }
    }

    fn check_memory(&self, memory_bytes: u64) -> Option<String> {
        if memory_bytes > self.config.memory_ceiling_bytes {
            Some(format!(
                "memory_bytes={memory_bytes} ceiling={}",
                self.config.memory_ceiling_bytes
            ))
        } else {
            None
        }
    }

    fn raise(&self, kind: AlertKind, detail: String) {
        let mut last_alert = self.last_alert.lock();
        let now = Instant::now();
        if let Some(fired_at) = last_alert.get(&kind) {
            if now.duration_since(*fired_at) < self.config.alert_cooldown {
                return;
            }
        }
        last_alert.insert(kind, now);
        drop(last_alert);

        metrics().resource_alerts_total.with_label_values(&[kind.as_str()]).inc();
        tracing::warn!(kind = kind.as_str(), detail = %detail, "resource monitor alert");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{
        AtomicUsize,
        Ordering,
    };

    use streamship_common::runtime::testing::TestRuntime;

    use super::*;

    struct FixedSampler {
        samples: Mutex<Vec<Sample>>,
        calls: AtomicUsize,
    }

    impl FixedSampler {
        fn new(samples: Vec<Sample>) -> Self {
            Self {
                samples: Mutex::new(samples),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ResourceSampler for FixedSampler {
        fn sample(&self) -> anyhow::Result<Sample> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            let samples = self.samples.lock();
            Ok(*samples.get(idx.min(samples.len() - 1)).unwrap())
        }
    }

    fn sample(threads: i64, fds: i64, memory_bytes: u64) -> Sample {
        Sample {
            threads: Some(threads),
            fds: Some(fds),
            memory_bytes,
        }
    }

    fn config() -> ResourceMonitorConfig {
        ResourceMonitorConfig {
            enabled: true,
            sample_interval: Duration::from_secs(15),
            thread_delta_threshold: 10,
            fd_delta_threshold: 10,
            memory_ceiling_bytes: 1_000_000,
            alert_cooldown: Duration::from_secs(300),
        }
    }

    #[test]
    fn first_sample_only_establishes_baseline() {
        let monitor = ResourceMonitor::with_sampler(config(), TestRuntime::new(), Box::new(FixedSampler::new(vec![])));
        monitor.observe(sample(5, 5, 0));
        assert!(monitor.baseline.lock().is_some());
    }

    #[test]
    fn thread_delta_over_threshold_raises_alert() {
        let monitor = ResourceMonitor::with_sampler(config(), TestRuntime::new(), Box::new(FixedSampler::new(vec![])));
        monitor.observe(sample(5, 5, 0));
        let before = monitor.last_alert.lock().len();
        monitor.observe(sample(20, 5, 0));
        assert_eq!(before, 0);
        assert!(monitor.last_alert.lock().contains_key(&AlertKind::Threads));
    }

    #[test]
    fn fd_delta_under_threshold_does_not_alert() {
        let monitor = ResourceMonitor::with_sampler(config(), TestRuntime::new(), Box::new(FixedSampler::new(vec![])));
        monitor.observe(sample(5, 5, 0));
        monitor.observe(sample(5, 12, 0));
        assert!(!monitor.last_alert.lock().contains_key(&AlertKind::FileDescriptors));
    }

    #[test]
    fn memory_over_ceiling_raises_alert_regardless_of_baseline() {
        let monitor = ResourceMonitor::with_sampler(config(), TestRuntime::new(), Box::new(FixedSampler::new(vec![])));
        monitor.observe(sample(5, 5, 2_000_000));
        assert!(monitor.last_alert.lock().contains_key(&AlertKind::Memory));
    }

    #[test]
    fn cooldown_suppresses_repeat_alerts() {
        let monitor = ResourceMonitor::with_sampler(config(), TestRuntime::new(), Box::new(FixedSampler::new(vec![])));
        monitor.observe(sample(5, 5, 0));
        monitor.observe(sample(20, 5, 0));
        let first_fired_at = *monitor.last_alert.lock().get(&AlertKind::Threads).unwrap();
        monitor.observe(sample(30, 5, 0));
        let second_fired_at = *monitor.last_alert.lock().get(&AlertKind::Threads).unwrap();
        assert_eq!(first_fired_at, second_fired_at);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_monitor_returns_immediately() {
        let mut disabled = config();
        disabled.enabled = false;
        let monitor = ResourceMonitor::with_sampler(disabled, TestRuntime::new(), Box::new(FixedSampler::new(vec![])));
        let (_tx, rx) = watch::channel(false);
        tokio::time::timeout(Duration::from_millis(50), monitor.run(rx))
            .await
            .expect("disabled monitor must not block on the sample loop");
    }
}
