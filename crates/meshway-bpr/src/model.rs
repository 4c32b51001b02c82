//! Piecewise-linear CPU-vs-request-rate model.
//!
//! Calibrated per core count over three onset-CPU ranges. Within a range,
//! predicted CPU = (request rate − intercept) / slope.

/// Penalty multiplier V in the drift-plus-penalty objective.
pub const PENALTY_V: f64 = 0.01;
/// Range boundary between the calibrated segments.
pub const CPU_LOW_THRESHOLD: f64 = 60.0;
/// Time-average CPU target enforced by the virtual queues.
pub const CPU_TARGET: f64 = 40.0;

/// One calibrated (slope, intercept) segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuModel {
    pub slope: f64,
    pub intercept: f64,
}

impl CpuModel {
    /// CPU predicted for a request rate under this segment.
    pub fn predict(&self, req_rate: i64) -> f64 {
        (req_rate as f64 - self.intercept) / self.slope
    }
}

const SEGMENTS_1C: [CpuModel; 3] = [
    CpuModel { slope: 36.87, intercept: 0.0 },
    CpuModel { slope: 35.08, intercept: 107.50 },
    CpuModel { slope: 33.43, intercept: -57.55 },
];

const SEGMENTS_2C: [CpuModel; 3] = [
    CpuModel { slope: 43.61, intercept: 0.0 },
    CpuModel { slope: 48.47, intercept: -291.55 },
    CpuModel { slope: 43.37, intercept: -2.06 },
];

/// Select the calibrated segment for a node by core count and onset CPU:
/// ≤ 60%, (60%, 70%], above 70%.
pub fn cpu_model(core_count: u32, onset_cpu: f64) -> CpuModel {
    let segments = if core_count <= 1 {
        &SEGMENTS_1C
    } else {
        &SEGMENTS_2C
    };
    if onset_cpu <= CPU_LOW_THRESHOLD {
        segments[0]
    } else if onset_cpu <= 70.0 {
        segments[1]
    } else {
        segments[2]
    }
}

/// Drift-term weight per node class: single-core nodes overload faster, so
/// their queue growth is priced double.
pub fn stability_weight(core_count: u32) -> f64 {
    if core_count <= 1 {
        1.0
    } else {
        0.5
    }
}
