//! Live system + run metrics.
//!
//! One snapshot combines host CPU/RAM readings with the dispatcher's run
//! facts (status, uptime, active sources, task counts). The control API
//! serves it both as a one-shot document and as a fixed-interval SSE feed.

use serde::Serialize;
use std::sync::Mutex;
use sysinfo::System;

/// Structured metrics payload, one per feed tick.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub status: String,
    pub uptime: String,
    pub active_sources: Vec<String>,
    pub tasks_completed: usize,
    pub posted_total: Option<u64>,
    pub cpu_percent: f32,
    pub ram_percent: f32,
    /// Human summary, e.g. `1.25 cores | 31.2% | 4 CPU`.
    pub cpu_usage: String,
    /// Human summary, e.g. `812 MB | 21.4% | 3792 MB`.
    pub ram_usage: String,
}

/// Host sampler. `sysinfo` wants `&mut` refreshes, so the `System` lives
/// behind a mutex and a snapshot is one short critical section.
pub struct MetricsSampler {
    system: Mutex<System>,
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Sample the host and combine with run facts supplied by the caller.
    pub fn snapshot(
        &self,
        active: bool,
        uptime_seconds: u64,
        active_sources: Vec<String>,
        tasks_completed: usize,
        posted_total: Option<u64>,
    ) -> MetricsSnapshot {
        let (cpu_percent, cores, total_mb, used_mb) = {
            let mut sys = self.system.lock().unwrap();
            sys.refresh_cpu_usage();
            sys.refresh_memory();
            (
                sys.global_cpu_usage(),
                sys.cpus().len(),
                sys.total_memory() / (1024 * 1024),
                sys.used_memory() / (1024 * 1024),
            )
        };

        let ram_percent = if total_mb > 0 {
            (used_mb as f32 / total_mb as f32) * 100.0
        } else {
            0.0
        };
        let core_equivalent = cores as f32 * (cpu_percent / 100.0);

        MetricsSnapshot {
            status: if active { "active" } else { "inactive" }.to_string(),
            uptime: format_uptime(uptime_seconds),
            active_sources,
            tasks_completed,
            posted_total,
            cpu_percent,
            ram_percent,
            cpu_usage: format!(
                "{:.2} cores | {:.1}% | {} CPU",
                core_equivalent, cpu_percent, cores
            ),
            ram_usage: format!("{} MB | {:.1}% | {} MB", used_mb, ram_percent, total_mb),
        }
    }
}

/// `HH:MM:SS`, hours unbounded.
pub fn format_uptime(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_formats_as_hms() {
        assert_eq!(format_uptime(0), "00:00:00");
        assert_eq!(format_uptime(61), "00:01:01");
        assert_eq!(format_uptime(3661), "01:01:01");
        assert_eq!(format_uptime(100 * 3600 + 59), "100:00:59");
    }

    #[test]
    fn snapshot_reflects_run_facts() {
        let sampler = MetricsSampler::new();
        let snap = sampler.snapshot(true, 75, vec!["feed".to_string()], 4, Some(4519));
        assert_eq!(snap.status, "active");
        assert_eq!(snap.uptime, "00:01:15");
        assert_eq!(snap.active_sources, vec!["feed".to_string()]);
        assert_eq!(snap.tasks_completed, 4);
        assert_eq!(snap.posted_total, Some(4519));
        assert!(snap.ram_percent >= 0.0);
    }
}
