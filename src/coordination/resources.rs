//! Per-agent resource sampling, limits, and advisory throttling
//!
//! Throttling is cooperative: a throttle record only tells callers to hold
//! back new work until it expires. Nothing here ever stops a process.

use crate::file_storage::{decode_record, encode_record, is_readable_version, MarkerStore, RECORD_VERSION};
use crate::utils::lock_mutex_recover;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio::sync::mpsc;

pub const RESOURCES_NAMESPACE: &str = "resources";
pub const THROTTLE_NAMESPACE: &str = "throttle";

/// Samples kept for the rolling summary by default
pub const DEFAULT_WINDOW_SIZE: usize = 60;

/// Point-in-time usage of one agent process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub memory_mb: u64,
    pub cpu_percent: f64,
    pub open_handles: u64,
    pub thread_count: u64,
    pub sampled_at: DateTime<Utc>,
}

/// Ceilings checked against [`ResourceUsage`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    #[serde(alias = "max_memory_mb", default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(alias = "max_cpu_percent", default = "default_max_cpu_percent")]
    pub max_cpu_percent: f64,
    #[serde(alias = "max_open_handles", default = "default_max_open_handles")]
    pub max_open_handles: u64,
    #[serde(alias = "max_threads", default = "default_max_threads")]
    pub max_threads: u64,
}

fn default_max_memory_mb() -> u64 {
    2048
}

fn default_max_cpu_percent() -> f64 {
    90.0
}

fn default_max_open_handles() -> u64 {
    1024
}

fn default_max_threads() -> u64 {
    256
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: default_max_memory_mb(),
            max_cpu_percent: default_max_cpu_percent(),
            max_open_handles: default_max_open_handles(),
            max_threads: default_max_threads(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    Cpu,
    OpenHandles,
    Threads,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ResourceKind::Memory => "memory",
            ResourceKind::Cpu => "cpu",
            ResourceKind::OpenHandles => "open handles",
            ResourceKind::Threads => "threads",
        })
    }
}

impl ResourceLimits {
    /// Metrics in `usage` above their ceiling
    pub fn violations(&self, usage: &ResourceUsage) -> Vec<ResourceKind> {
        let mut violations = Vec::new();
        if usage.memory_mb > self.max_memory_mb {
            violations.push(ResourceKind::Memory);
        }
        if usage.cpu_percent > self.max_cpu_percent {
            violations.push(ResourceKind::Cpu);
        }
        if usage.open_handles > self.max_open_handles {
            violations.push(ResourceKind::OpenHandles);
        }
        if usage.thread_count > self.max_threads {
            violations.push(ResourceKind::Threads);
        }
        violations
    }
}

/// Aggregate over the rolling sample window
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub samples: usize,
    pub avg_memory_mb: f64,
    pub peak_memory_mb: u64,
    pub avg_cpu_percent: f64,
    pub peak_cpu_percent: f64,
    pub peak_open_handles: u64,
    pub peak_threads: u64,
}

impl UsageSummary {
    fn from_samples<'a>(samples: impl ExactSizeIterator<Item = &'a ResourceUsage>) -> Self {
        let count = samples.len();
        let mut summary = UsageSummary {
            samples: count,
            ..Default::default()
        };
        if count == 0 {
            return summary;
        }

        let mut memory_total = 0.0;
        let mut cpu_total = 0.0;
        for usage in samples {
            memory_total += usage.memory_mb as f64;
            cpu_total += usage.cpu_percent;
            summary.peak_memory_mb = summary.peak_memory_mb.max(usage.memory_mb);
            summary.peak_cpu_percent = summary.peak_cpu_percent.max(usage.cpu_percent);
            summary.peak_open_handles = summary.peak_open_handles.max(usage.open_handles);
            summary.peak_threads = summary.peak_threads.max(usage.thread_count);
        }
        summary.avg_memory_mb = memory_total / count as f64;
        summary.avg_cpu_percent = cpu_total / count as f64;
        summary
    }
}

/// Latest usage published by one agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    #[serde(default)]
    pub version: u32,
    pub agent_id: String,
    pub usage: ResourceUsage,
    pub summary: UsageSummary,
    pub limits: ResourceLimits,
    pub within_limits: bool,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct ThrottleRecord {
    #[serde(default)]
    version: u32,
    agent_id: String,
    throttled_at: DateTime<Utc>,
    until: DateTime<Utc>,
}

struct MonitorInner {
    store: Arc<dyn MarkerStore>,
    agent_id: String,
    pid: Pid,
    system: Mutex<System>,
    limits: Mutex<ResourceLimits>,
    window: Mutex<VecDeque<ResourceUsage>>,
    window_size: usize,
    sampling: AtomicBool,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
}

/// Resource monitor for the current process. Clones share state.
#[derive(Clone)]
pub struct ResourceMonitor {
    inner: Arc<MonitorInner>,
}

impl ResourceMonitor {
    pub fn new(
        store: Arc<dyn MarkerStore>,
        agent_id: impl Into<String>,
        limits: ResourceLimits,
        window_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                store,
                agent_id: agent_id.into(),
                pid: Pid::from_u32(std::process::id()),
                system: Mutex::new(System::new()),
                limits: Mutex::new(limits),
                window: Mutex::new(VecDeque::new()),
                window_size: window_size.max(1),
                sampling: AtomicBool::new(false),
                stop_tx: Mutex::new(None),
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    /// Sample this process now.
    ///
    /// CPU is measured since the previous sample, so the first reading is 0.
    pub fn get_current_usage(&self) -> ResourceUsage {
        let pid = self.inner.pid;
        let mut system = lock_mutex_recover(&self.inner.system);
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);

        let (memory_mb, cpu_percent, tasks) = match system.process(pid) {
            Some(process) => (
                process.memory() / 1024 / 1024,
                process.cpu_usage() as f64,
                process.tasks().map(|t| t.len() as u64),
            ),
            None => {
                log::debug!("Process {} not visible to sysinfo", pid);
                (0, 0.0, None)
            }
        };

        ResourceUsage {
            memory_mb,
            cpu_percent,
            open_handles: open_handle_count(pid).unwrap_or(0),
            thread_count: thread_count(pid).or(tasks).unwrap_or(1),
            sampled_at: Utc::now(),
        }
    }

    /// Replace the ceilings
    pub fn set_limits(&self, limits: ResourceLimits) {
        *lock_mutex_recover(&self.inner.limits) = limits;
    }

    pub fn limits(&self) -> ResourceLimits {
        *lock_mutex_recover(&self.inner.limits)
    }

    /// `true` only if every sampled metric is within its ceiling
    pub fn check_limits(&self) -> bool {
        let usage = self.get_current_usage();
        let violations = self.limits().violations(&usage);
        for kind in &violations {
            log::warn!("Agent {} exceeds its {} limit", self.inner.agent_id, kind);
        }
        violations.is_empty()
    }

    /// Ask other callers to hold back work for this agent for `duration`
    pub fn throttle_agent(&self, duration: Duration) -> bool {
        self.throttle(&self.inner.agent_id, duration)
    }

    /// Throttle any agent sharing the store
    pub fn throttle(&self, agent_id: &str, duration: Duration) -> bool {
        let now = Utc::now();
        let until = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or_else(|| now + chrono::Duration::days(36_500));
        let record = ThrottleRecord {
            version: RECORD_VERSION,
            agent_id: agent_id.to_string(),
            throttled_at: now,
            until,
        };

        let result = encode_record(&record)
            .and_then(|content| self.inner.store.replace(THROTTLE_NAMESPACE, agent_id, &content));
        match result {
            Ok(()) => {
                log::info!("Throttled agent {} until {}", agent_id, until.to_rfc3339());
                true
            }
            Err(e) => {
                log::warn!("Failed to throttle agent {}: {}", agent_id, e);
                false
            }
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.is_agent_throttled(&self.inner.agent_id)
    }

    /// Whether `agent_id` has an unexpired throttle; expired records are removed
    pub fn is_agent_throttled(&self, agent_id: &str) -> bool {
        let bytes = match self.inner.store.read(THROTTLE_NAMESPACE, agent_id) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return false,
            Err(e) => {
                log::warn!("Failed to read throttle for {}: {}", agent_id, e);
                return false;
            }
        };

        let record = match decode_record::<ThrottleRecord>(&bytes) {
            Ok(record) if is_readable_version(record.version) => record,
            _ => return false,
        };

        if Utc::now() < record.until {
            return true;
        }

        // Lapsed; a fresh throttle written meanwhile is left alone
        let _ = self
            .inner
            .store
            .remove_if_matches(THROTTLE_NAMESPACE, agent_id, &bytes);
        false
    }

    /// Add an externally taken sample to the rolling window
    pub fn record_sample(&self, usage: ResourceUsage) {
        let mut window = lock_mutex_recover(&self.inner.window);
        window.push_back(usage);
        while window.len() > self.inner.window_size {
            window.pop_front();
        }
    }

    pub fn usage_summary(&self) -> UsageSummary {
        let window = lock_mutex_recover(&self.inner.window);
        UsageSummary::from_samples(window.iter())
    }

    /// Sample now and publish the result for other processes
    pub fn report_usage(&self) -> bool {
        let usage = self.get_current_usage();
        self.record_sample(usage.clone());
        self.write_report(usage)
    }

    fn write_report(&self, usage: ResourceUsage) -> bool {
        let limits = self.limits();
        let report = UsageReport {
            version: RECORD_VERSION,
            agent_id: self.inner.agent_id.clone(),
            within_limits: limits.violations(&usage).is_empty(),
            usage,
            summary: self.usage_summary(),
            limits,
            reported_at: Utc::now(),
        };

        let result = encode_record(&report).and_then(|content| {
            self.inner
                .store
                .replace(RESOURCES_NAMESPACE, &self.inner.agent_id, &content)
        });
        match result {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to report usage for {}: {}", self.inner.agent_id, e);
                false
            }
        }
    }

    /// Latest report published by `agent_id`
    pub fn read_usage_report(&self, agent_id: &str) -> Option<UsageReport> {
        let bytes = self.inner.store.read(RESOURCES_NAMESPACE, agent_id).ok()??;
        decode_record::<UsageReport>(&bytes)
            .ok()
            .filter(|report| is_readable_version(report.version))
    }

    /// Sample and report every `interval` on the current tokio runtime
    pub fn start_sampling(&self, interval: Duration) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("No tokio runtime; sampling for {} not started", self.inner.agent_id);
            return false;
        };
        if self.inner.sampling.swap(true, Ordering::SeqCst) {
            return false;
        }

        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        *lock_mutex_recover(&self.inner.stop_tx) = Some(stop_tx);

        let monitor = self.clone();
        let interval = interval.max(Duration::from_millis(1));
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let tick = monitor.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || tick.report_usage()).await {
                            log::warn!("Usage report for {} failed: {}", monitor.inner.agent_id, e);
                        }
                    }
                    _ = stop_rx.recv() => {
                        log::debug!("Resource sampling for {} shutting down", monitor.inner.agent_id);
                        break;
                    }
                }
            }
        });

        true
    }

    pub fn stop_sampling(&self) -> bool {
        if !self.inner.sampling.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(tx) = lock_mutex_recover(&self.inner.stop_tx).take() {
            let _ = tx.try_send(());
        }
        true
    }

    pub fn is_sampling(&self) -> bool {
        self.inner.sampling.load(Ordering::SeqCst)
    }
}

#[cfg(target_os = "linux")]
fn count_entries(path: String) -> Option<u64> {
    std::fs::read_dir(path).ok().map(|entries| entries.count() as u64)
}

#[cfg(target_os = "linux")]
fn open_handle_count(pid: Pid) -> Option<u64> {
    count_entries(format!("/proc/{}/fd", pid))
}

#[cfg(target_os = "linux")]
fn thread_count(pid: Pid) -> Option<u64> {
    count_entries(format!("/proc/{}/task", pid))
}

#[cfg(not(target_os = "linux"))]
fn open_handle_count(_pid: Pid) -> Option<u64> {
    None
}

#[cfg(not(target_os = "linux"))]
fn thread_count(_pid: Pid) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_storage::MemoryMarkerStore;

    fn monitor(store: &Arc<dyn MarkerStore>, agent_id: &str) -> ResourceMonitor {
        ResourceMonitor::new(store.clone(), agent_id, ResourceLimits::default(), 3)
    }

    fn usage(memory_mb: u64, cpu_percent: f64) -> ResourceUsage {
        ResourceUsage {
            memory_mb,
            cpu_percent,
            open_handles: 10,
            thread_count: 4,
            sampled_at: Utc::now(),
        }
    }

    #[test]
    fn test_violations_report_each_metric() {
        let limits = ResourceLimits {
            max_memory_mb: 100,
            max_cpu_percent: 50.0,
            max_open_handles: 5,
            max_threads: 8,
        };
        assert_eq!(
            limits.violations(&usage(200, 75.0)),
            vec![ResourceKind::Memory, ResourceKind::Cpu, ResourceKind::OpenHandles]
        );
        assert!(ResourceLimits::default().violations(&usage(100, 10.0)).is_empty());
    }

    #[test]
    fn test_current_usage_sees_this_process() {
        let store: Arc<dyn MarkerStore> = Arc::new(MemoryMarkerStore::new());
        let monitor = monitor(&store, "agent-1");
        let usage = monitor.get_current_usage();
        assert!(usage.thread_count >= 1);
        assert!(usage.cpu_percent >= 0.0);
    }

    #[test]
    fn test_check_limits_against_tiny_ceiling() {
        let store: Arc<dyn MarkerStore> = Arc::new(MemoryMarkerStore::new());
        let monitor = monitor(&store, "agent-1");
        let unlimited = ResourceLimits {
            max_memory_mb: u64::MAX,
            max_cpu_percent: f64::MAX,
            max_open_handles: u64::MAX,
            max_threads: u64::MAX,
        };
        monitor.set_limits(unlimited);
        assert!(monitor.check_limits());

        monitor.set_limits(ResourceLimits {
            max_threads: 0,
            ..unlimited
        });
        assert_eq!(monitor.limits().max_threads, 0);
        assert!(!monitor.check_limits());
    }

    #[test]
    fn test_throttle_is_visible_to_other_monitors_and_expires() {
        let store: Arc<dyn MarkerStore> = Arc::new(MemoryMarkerStore::new());
        let worker = monitor(&store, "agent-1");
        let coordinator = monitor(&store, "coordinator");

        assert!(!worker.is_throttled());
        assert!(worker.throttle_agent(Duration::from_millis(30)));
        assert!(worker.is_throttled());
        assert!(coordinator.is_agent_throttled("agent-1"));

        std::thread::sleep(Duration::from_millis(50));
        assert!(!worker.is_throttled());
        assert!(store.read(THROTTLE_NAMESPACE, "agent-1").unwrap().is_none());
    }

    #[test]
    fn test_window_keeps_latest_samples() {
        let store: Arc<dyn MarkerStore> = Arc::new(MemoryMarkerStore::new());
        let monitor = monitor(&store, "agent-1");
        for (memory, cpu) in [(10, 90.0), (20, 10.0), (30, 20.0), (40, 30.0)] {
            monitor.record_sample(usage(memory, cpu));
        }

        let summary = monitor.usage_summary();
        assert_eq!(summary.samples, 3);
        assert_eq!(summary.peak_memory_mb, 40);
        assert_eq!(summary.avg_memory_mb, 30.0);
        assert_eq!(summary.peak_cpu_percent, 30.0);
        assert_eq!(summary.avg_cpu_percent, 20.0);
    }

    #[test]
    fn test_report_usage_is_readable_by_peers() {
        let store: Arc<dyn MarkerStore> = Arc::new(MemoryMarkerStore::new());
        let worker = monitor(&store, "agent-1");
        let coordinator = monitor(&store, "coordinator");

        assert!(coordinator.read_usage_report("agent-1").is_none());
        assert!(worker.report_usage());

        let report = coordinator.read_usage_report("agent-1").unwrap();
        assert_eq!(report.agent_id, "agent-1");
        assert_eq!(report.summary.samples, 1);
    }

    #[tokio::test]
    async fn test_sampling_loop_fills_window() {
        let store: Arc<dyn MarkerStore> = Arc::new(MemoryMarkerStore::new());
        let monitor = monitor(&store, "agent-1");

        assert!(monitor.start_sampling(Duration::from_millis(10)));
        assert!(!monitor.start_sampling(Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(monitor.stop_sampling());
        assert!(!monitor.is_sampling());

        assert_eq!(monitor.usage_summary().samples, 3);
        assert!(monitor.read_usage_report("agent-1").is_some());
    }
}
