//! `pids` controller: `pids.max`, `pids.current`, and the `pids.events`
//! limit watch

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use super::{Controller, stat_value};
use crate::cgroupfs::CgroupFs;
use crate::container::{ContainerId, Limitation, Limits, ResourceStatistics, Resources};
use crate::errors::Result;
use crate::watcher::{self, Watcher};

pub struct PidsController {
    fs: Arc<CgroupFs>,
    watcher: Watcher,
}

impl PidsController {
    pub fn new(fs: Arc<CgroupFs>) -> Self {
        Self {
            fs,
            watcher: Watcher::new(watcher::DEFAULT_POLL_INTERVAL),
        }
    }

    fn limit_hits(&self, cgroup: &str) -> Option<u64> {
        let events = self.fs.read_control(cgroup, "pids.events").ok()?;
        stat_value(&events, "max")
    }
}

#[async_trait]
impl Controller for PidsController {
    fn name(&self) -> &'static str {
        "pids"
    }

    async fn update(
        &self,
        _container_id: &ContainerId,
        cgroup: &str,
        requests: &Resources,
        _limits: &Limits,
    ) -> Result<()> {
        let max = match requests.pids {
            Some(pids) => pids.to_string(),
            None => "max".to_string(),
        };
        self.fs.write_control(cgroup, "pids.max", &max)
    }

    async fn watch(&self, container_id: &ContainerId, cgroup: &str) -> Result<Limitation> {
        let path = self.fs.path(cgroup).join("pids.events");
        let initial = self.limit_hits(cgroup).unwrap_or(0);

        let mut events = match self.watcher.add(&path) {
            Ok(events) => events,
            Err(e) => {
                debug!("Not watching pids events of container '{container_id}': {e}");
                return std::future::pending().await;
            }
        };

        while let Some(event) = events.recv().await {
            if event != watcher::Event::Modified {
                break;
            }
            if let Some(count) = self.limit_hits(cgroup)
                && count > initial
            {
                return Ok(Limitation {
                    controller: self.name().to_string(),
                    resource: "pids".to_string(),
                    message: format!(
                        "Process limit exceeded: container '{container_id}' hit pids.max"
                    ),
                });
            }
        }

        std::future::pending().await
    }

    async fn usage(&self, _container_id: &ContainerId, cgroup: &str) -> Result<ResourceStatistics> {
        let current = self.fs.read_control(cgroup, "pids.current")?;
        Ok(ResourceStatistics {
            processes: current.trim().parse().ok(),
            ..Default::default()
        })
    }
}
