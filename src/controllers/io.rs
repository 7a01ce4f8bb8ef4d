//! `io` controller: `io.weight`, `io.stat`

use std::sync::Arc;

use async_trait::async_trait;

use super::Controller;
use crate::cgroupfs::CgroupFs;
use crate::container::{ContainerId, Limits, ResourceStatistics, Resources};
use crate::errors::Result;

pub struct IoController {
    fs: Arc<CgroupFs>,
}

impl IoController {
    pub fn new(fs: Arc<CgroupFs>) -> Self {
        Self { fs }
    }
}

// `io.stat` carries one line per device:
//   8:0 rbytes=1024 wbytes=2048 rios=10 wios=20 dbytes=0 dios=0
fn device_field(line: &str, key: &str) -> u64 {
    line.split_whitespace()
        .filter_map(|field| field.split_once('='))
        .find(|(name, _)| *name == key)
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl Controller for IoController {
    fn name(&self) -> &'static str {
        "io"
    }

    async fn update(
        &self,
        _container_id: &ContainerId,
        cgroup: &str,
        requests: &Resources,
        _limits: &Limits,
    ) -> Result<()> {
        if let Some(weight) = requests.io_weight {
            self.fs
                .write_control(cgroup, "io.weight", &format!("default {weight}"))?;
        }
        Ok(())
    }

    async fn usage(&self, _container_id: &ContainerId, cgroup: &str) -> Result<ResourceStatistics> {
        let stat = self.fs.read_control(cgroup, "io.stat")?;

        let mut stats = ResourceStatistics::default();
        let (mut rbytes, mut wbytes, mut rios, mut wios) = (0, 0, 0, 0);
        let mut seen = false;
        for line in stat.lines().filter(|line| !line.trim().is_empty()) {
            seen = true;
            rbytes += device_field(line, "rbytes");
            wbytes += device_field(line, "wbytes");
            rios += device_field(line, "rios");
            wios += device_field(line, "wios");
        }

        if seen {
            stats.io_read_bytes = Some(rbytes);
            stats.io_write_bytes = Some(wbytes);
            stats.io_read_ops = Some(rios);
            stats.io_write_ops = Some(wios);
        }
        Ok(stats)
    }
}
