//! CPU/memory sampling for the heartbeat stats stream.

use sysinfo::System;

/// Returns `(cpu_usage, memory_usage)` as percentages.
pub fn sample_system() -> (f32, f32) {
    let mut sys = System::new_all();
    sys.refresh_cpu();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_info().cpu_usage();
    let total = sys.total_memory();
    let used = sys.used_memory();
    let memory_usage = if total == 0 {
        0.0
    } else {
        (used as f32 / total as f32) * 100.0
    };

    (cpu_usage, memory_usage)
}
