//! ==============================================================================
//! probe.rs - host utilisation sampling for sensor nodes
//! ==============================================================================
//!
//! purpose:
//!     reads cpu load and disk usage from the local machine via sysinfo, and
//!     decides whether a sample looks sane before it is sent to the hub.
//!
//! cpu usage is a delta between two refreshes, so the first sample after
//! `HostProbe::new` is only meaningful once `sysinfo::MINIMUM_CPU_UPDATE_INTERVAL`
//! has passed.
//!
//! ==============================================================================

use std::path::{Path, PathBuf};

use sysinfo::{Disks, System};

use crate::domain::MetricKind;

pub struct HostProbe {
    system: System,
    disks: Disks,
    disk_path: PathBuf,
}

impl HostProbe {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
            disk_path: disk_path.into(),
        }
    }

    /// Overall cpu utilisation since the previous call, in percent.
    pub fn cpu_usage_percent(&mut self) -> f64 {
        self.system.refresh_cpu();
        self.system.global_cpu_info().cpu_usage() as f64
    }

    /// Used space on the filesystem mounted at the configured path, in percent.
    ///
    /// `None` when no disk is mounted there or it reports zero size.
    pub fn disk_usage_percent(&mut self) -> Option<f64> {
        self.disks.refresh();
        let disk = self
            .disks
            .list()
            .iter()
            .find(|d| d.mount_point() == self.disk_path.as_path())?;

        used_percent(disk.total_space(), disk.available_space())
    }

    pub fn disk_path(&self) -> &Path {
        &self.disk_path
    }
}

fn used_percent(total: u64, available: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(available);
    Some(used as f64 / total as f64 * 100.0)
}

/// Client-side sanity check before a reading is sent.
///
/// cpu must sit in 0..=100, disk must not exceed 100, and the id must be set.
/// a failed check is still sent, flagged with `data_consistent = false`.
pub fn is_consistent(sensor_id: &str, kind: MetricKind, value: f64) -> bool {
    if sensor_id.is_empty() || !value.is_finite() {
        return false;
    }
    match kind {
        MetricKind::Cpu => (0.0..=100.0).contains(&value),
        MetricKind::Disk => value <= 100.0,
    }
}
