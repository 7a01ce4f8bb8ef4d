//! `cpuset` controller: `cpuset.cpus`

use std::sync::Arc;

use async_trait::async_trait;

use super::Controller;
use crate::cgroupfs::CgroupFs;
use crate::container::{ContainerId, ContainerStatus, Limits, Resources};
use crate::errors::Result;

pub struct CpusetController {
    fs: Arc<CgroupFs>,
}

impl CpusetController {
    pub fn new(fs: Arc<CgroupFs>) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Controller for CpusetController {
    fn name(&self) -> &'static str {
        "cpuset"
    }

    async fn update(
        &self,
        _container_id: &ContainerId,
        cgroup: &str,
        requests: &Resources,
        _limits: &Limits,
    ) -> Result<()> {
        if let Some(mask) = &requests.cpuset_cpus {
            self.fs.write_control(cgroup, "cpuset.cpus", mask)?;
        }
        Ok(())
    }

    async fn status(&self, _container_id: &ContainerId, cgroup: &str) -> Result<ContainerStatus> {
        let effective = self.fs.read_control(cgroup, "cpuset.cpus.effective")?;
        Ok(ContainerStatus {
            cpuset_effective: Some(effective.trim().to_string()),
            ..Default::default()
        })
    }
}
