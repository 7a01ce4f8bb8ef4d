//! `cpu` controller: `cpu.weight`, `cpu.max`, `cpu.stat`

use std::sync::Arc;

use async_trait::async_trait;

use super::{Controller, stat_value};
use crate::cgroupfs::CgroupFs;
use crate::container::{ContainerId, Limits, ResourceStatistics, Resources};
use crate::errors::Result;

/// Scheduling period for `cpu.max`, in microseconds.
const CPU_PERIOD_US: u64 = 100_000;

/// The kernel's minimum for v1-style cpu shares.
const MIN_SHARES: u64 = 2;

pub struct CpuController {
    fs: Arc<CgroupFs>,
}

impl CpuController {
    pub fn new(fs: Arc<CgroupFs>) -> Self {
        Self { fs }
    }
}

/// v1-style shares for a cpu request.
fn shares(cpus: f64) -> u64 {
    ((cpus * 1024.0) as u64).max(MIN_SHARES)
}

/// Map shares [2, 262144] onto the v2 weight range [1, 10000], the same
/// conversion systemd and runc apply.
fn weight(shares: u64) -> u64 {
    (1 + (shares.saturating_sub(2)) * 9999 / 262142).min(10_000)
}

#[async_trait]
impl Controller for CpuController {
    fn name(&self) -> &'static str {
        "cpu"
    }

    async fn update(
        &self,
        _container_id: &ContainerId,
        cgroup: &str,
        requests: &Resources,
        limits: &Limits,
    ) -> Result<()> {
        if let Some(cpus) = requests.cpus {
            self.fs
                .write_control(cgroup, "cpu.weight", &weight(shares(cpus)).to_string())?;
        }

        // The hard limit falls back to the request; neither means the
        // container is unthrottled.
        let quota = match limits.cpus.or(requests.cpus) {
            Some(cpus) => format!("{} {}", (cpus * CPU_PERIOD_US as f64) as u64, CPU_PERIOD_US),
            None => "max".to_string(),
        };
        self.fs.write_control(cgroup, "cpu.max", &quota)
    }

    async fn usage(&self, _container_id: &ContainerId, cgroup: &str) -> Result<ResourceStatistics> {
        let stat = self.fs.read_control(cgroup, "cpu.stat")?;

        Ok(ResourceStatistics {
            cpus_user_time_secs: stat_value(&stat, "user_usec").map(usec_to_secs),
            cpus_system_time_secs: stat_value(&stat, "system_usec").map(usec_to_secs),
            cpus_nr_throttled: stat_value(&stat, "nr_throttled"),
            cpus_throttled_time_secs: stat_value(&stat, "throttled_usec").map(usec_to_secs),
            ..Default::default()
        })
    }
}

fn usec_to_secs(usec: u64) -> f64 {
    usec as f64 / 1_000_000.0
}
