//! Synthetic `core` controller over the `cgroup.*` files
//!
//! Always registered: the files it interfaces with exist in every cgroup,
//! whether or not any kernel controller is enabled. Never written into
//! `cgroup.subtree_control`.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Controller, stat_value};
use crate::cgroupfs::CgroupFs;
use crate::container::{ContainerId, ContainerStatus, ResourceStatistics};
use crate::errors::Result;

pub struct CoreController {
    fs: Arc<CgroupFs>,
}

impl CoreController {
    pub fn new(fs: Arc<CgroupFs>) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Controller for CoreController {
    fn name(&self) -> &'static str {
        "core"
    }

    async fn usage(&self, _container_id: &ContainerId, cgroup: &str) -> Result<ResourceStatistics> {
        // Threads across the whole subtree; `cgroup.threads` lists one tid
        // per line and is empty in non-leaf cgroups.
        let mut cgroups = vec![cgroup.to_string()];
        cgroups.extend(self.fs.list_descendants(cgroup)?);

        let mut threads = 0u64;
        let mut seen = false;
        for current in &cgroups {
            if let Ok(content) = self.fs.read_control(current, "cgroup.threads") {
                seen = true;
                threads += content.lines().filter(|line| !line.trim().is_empty()).count() as u64;
            }
        }

        Ok(ResourceStatistics {
            threads: seen.then_some(threads),
            ..Default::default()
        })
    }

    async fn status(&self, _container_id: &ContainerId, cgroup: &str) -> Result<ContainerStatus> {
        let events = self.fs.read_control(cgroup, "cgroup.events")?;
        Ok(ContainerStatus {
            cgroup: Some(cgroup.to_string()),
            frozen: stat_value(&events, "frozen").map(|v| v != 0),
            populated: stat_value(&events, "populated").map(|v| v != 0),
            ..Default::default()
        })
    }
}
