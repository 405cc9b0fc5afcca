use serde::Serialize;
use std::path::Path;
use std::thread;
use sysinfo::{Disks, System};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryUsage {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskUsage {
    pub mount_point: String,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

/// Point-in-time host metrics. Each section is `None` when it could not be sampled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub cpu: Option<f64>,
    pub memory: Option<MemoryUsage>,
    pub disk: Option<DiskUsage>,
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((part as f64 / total as f64) * 1000.0).round() / 10.0
}

fn sample_cpu(system: &System) -> Option<f64> {
    if system.cpus().is_empty() {
        tracing::warn!("no cpus reported, skipping cpu sample");
        return None;
    }
    let usage = system.global_cpu_usage() as f64;
    usage.is_finite().then(|| (usage * 10.0).round() / 10.0)
}

fn sample_memory(system: &System) -> Option<MemoryUsage> {
    let total = system.total_memory();
    if total == 0 {
        tracing::warn!("memory totals unavailable");
        return None;
    }
    let used = system.used_memory();
    Some(MemoryUsage {
        total,
        available: system.available_memory(),
        used,
        percent: percent(used, total),
    })
}

/// Usage of the filesystem mounted at `mount`.
pub fn sample_disk(mount: &Path) -> Option<DiskUsage> {
    let disks = Disks::new_with_refreshed_list();
    let Some(disk) = disks.list().iter().find(|disk| disk.mount_point() == mount) else {
        tracing::warn!(mount = %mount.display(), "no disk mounted at path");
        return None;
    };
    let total = disk.total_space();
    let free = disk.available_space();
    let used = total.saturating_sub(free);
    Some(DiskUsage {
        mount_point: mount.to_string_lossy().to_string(),
        total,
        used,
        free,
        percent: percent(used, total),
    })
}

/// Blocks for the CPU sampling interval (a few hundred milliseconds).
pub fn sample_resources() -> ResourceSnapshot {
    let mut system = System::new();
    system.refresh_memory();
    system.refresh_cpu_usage();
    thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL.max(std::time::Duration::from_millis(500)));
    system.refresh_cpu_usage();
    ResourceSnapshot {
        cpu: sample_cpu(&system),
        memory: sample_memory(&system),
        disk: sample_disk(Path::new("/")),
    }
}
