//! System metrics collection.
//!
//! Samples CPU and memory utilization via sysinfo; core count comes from
//! the runtime's view of hardware parallelism with a conservative
//! fallback.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use sysinfo::System;

use meshway_heartbeat::proto::Metrics;

/// Samples system metrics for heartbeat reports.
pub struct MetricsCollector {
    node_ip: String,
    sys: Mutex<System>,
}

impl MetricsCollector {
    pub fn new(node_ip: String) -> Self {
        let mut sys = System::new();
        // Prime the CPU sampler; the first delta-based reading needs a
        // baseline.
        sys.refresh_cpu_usage();
        Self {
            node_ip,
            sys: Mutex::new(sys),
        }
    }

    /// Take one metrics sample.
    pub fn collect(&self) -> Metrics {
        let mut sys = self.sys.lock().expect("sysinfo lock poisoned");
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu_usage = f64::from(sys.global_cpu_usage());
        let total = sys.total_memory().max(1);
        let memory_usage = (sys.used_memory() as f64 / total as f64) * 100.0;
        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        Metrics {
            ip: self.node_ip.clone(),
            cpu_usage,
            cpu_cores,
            memory_usage,
            collected_at: epoch_secs() as i64,
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
