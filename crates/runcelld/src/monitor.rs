//! Resource monitoring for the runcell daemon.
//!
//! Samples the daemon's own CPU and memory alongside the processes it is
//! supervising, and logs them with the orchestrator's session counts:
//! - Periodic logging of resource usage
//! - Warnings when thresholds are exceeded
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Uses pattern matching and `unwrap_or` for fallible operations

use std::process;
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::orchestrator::OrchestratorHandle;

/// Current resource snapshot.
#[derive(Debug, Clone, Default)]
pub struct ProcessMetrics {
    /// Daemon memory usage in bytes
    pub memory_bytes: u64,

    /// Daemon memory usage in megabytes (convenience)
    pub memory_mb: u64,

    /// Daemon CPU usage as percentage (0.0 - 100.0+)
    pub cpu_percent: f32,

    /// Direct children of the daemon (one leader per attached process)
    pub children: usize,

    /// Memory held by those children, in megabytes
    pub children_memory_mb: u64,

    pub memory_high: bool,
    pub cpu_high: bool,
}

impl ProcessMetrics {
    /// Returns true if any metric is above its threshold.
    pub fn is_any_high(&self) -> bool {
        self.memory_high || self.cpu_high
    }
}

/// Samples the daemon process and its children through `sysinfo`.
pub struct ProcessMonitor {
    system: System,
    pid: Pid,
    memory_threshold_mb: u64,
    cpu_threshold_percent: f32,
}

impl ProcessMonitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self::with_thresholds(config.memory_warn_mb, config.cpu_warn_percent)
    }

    pub fn with_thresholds(memory_threshold_mb: u64, cpu_threshold_percent: f32) -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(process::id()),
            memory_threshold_mb,
            cpu_threshold_percent,
        }
    }

    /// Refreshes process information and returns current metrics.
    ///
    /// CPU usage is measured against the previous refresh, so the first
    /// call after construction reports 0.
    pub fn refresh(&mut self) -> ProcessMetrics {
        // Per-process refresh does not compute CPU usage.
        self.system.refresh_all();

        let (memory_bytes, cpu_percent) = self
            .system
            .process(self.pid)
            .map(|p| (p.memory(), p.cpu_usage()))
            .unwrap_or((0, 0.0));

        let (children, children_memory) = self
            .system
            .processes()
            .values()
            .filter(|p| p.parent() == Some(self.pid))
            .fold((0usize, 0u64), |(count, memory), p| {
                (count + 1, memory + p.memory())
            });

        let memory_mb = memory_bytes / 1024 / 1024;
        ProcessMetrics {
            memory_bytes,
            memory_mb,
            cpu_percent,
            children,
            children_memory_mb: children_memory / 1024 / 1024,
            memory_high: memory_mb > self.memory_threshold_mb,
            cpu_high: cpu_percent > self.cpu_threshold_percent,
        }
    }

    pub fn memory_threshold_mb(&self) -> u64 {
        self.memory_threshold_mb
    }

    pub fn cpu_threshold_percent(&self) -> f32 {
        self.cpu_threshold_percent
    }
}

/// Spawns the periodic monitoring task.
///
/// Stops when `cancel_token` is cancelled.
pub fn spawn_monitor_task(
    config: MonitorConfig,
    orchestrator: OrchestratorHandle,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut monitor = ProcessMonitor::new(&config);
        let period = Duration::from_secs(config.interval_secs.max(1));
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Baseline for CPU calculation
        let _ = monitor.refresh();

        info!(
            memory_threshold_mb = monitor.memory_threshold_mb(),
            cpu_threshold_percent = monitor.cpu_threshold_percent(),
            interval_secs = period.as_secs(),
            "Resource monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Resource monitor shutting down");
                    break;
                }

                _ = tick.tick() => {
                    let metrics = monitor.refresh();
                    let (live, max) = orchestrator
                        .stats()
                        .await
                        .map(|stats| (stats.live, stats.max_sessions))
                        .unwrap_or((0, 0));
                    log_metrics(&metrics, &monitor, live, max);
                }
            }
        }

        debug!("Resource monitor task completed");
    })
}

fn log_metrics(metrics: &ProcessMetrics, monitor: &ProcessMonitor, live: usize, max: usize) {
    if metrics.memory_high {
        warn!(
            memory_mb = metrics.memory_mb,
            threshold_mb = monitor.memory_threshold_mb(),
            sessions = live,
            "HIGH MEMORY: Daemon memory usage above threshold"
        );
    } else if metrics.cpu_high {
        warn!(
            cpu_percent = format!("{:.1}", metrics.cpu_percent),
            threshold_percent = monitor.cpu_threshold_percent(),
            sessions = live,
            "HIGH CPU: Daemon CPU usage above threshold"
        );
    } else {
        debug!(
            memory_mb = metrics.memory_mb,
            cpu_percent = format!("{:.1}", metrics.cpu_percent),
            children = metrics.children,
            children_memory_mb = metrics.children_memory_mb,
            sessions = live,
            max_sessions = max,
            "Daemon resource usage"
        );
    }
}
