//! `memory` controller: `memory.low`, `memory.max`, `memory.oom.group`,
//! `memory.current`, `memory.stat`, and the `memory.events` OOM watch

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;

use super::{Controller, stat_value};
use crate::cgroupfs::CgroupFs;
use crate::container::{
    ContainerConfig, ContainerId, Limitation, Limits, ResourceStatistics, Resources,
};
use crate::errors::Result;
use crate::watcher::{self, Watcher};

pub struct MemoryController {
    fs: Arc<CgroupFs>,
    watcher: Watcher,
    // OOM score adjustments remembered between prepare and isolate; the
    // score is per process, so it can only be applied once a pid exists.
    oom_score_adjs: Mutex<HashMap<ContainerId, i32>>,
}

impl MemoryController {
    pub fn new(fs: Arc<CgroupFs>) -> Self {
        Self {
            fs,
            watcher: Watcher::new(watcher::DEFAULT_POLL_INTERVAL),
            oom_score_adjs: Mutex::new(HashMap::new()),
        }
    }

    fn oom_kills(&self, cgroup: &str) -> Option<u64> {
        let events = self.fs.read_control(cgroup, "memory.events").ok()?;
        stat_value(&events, "oom_kill")
    }
}

#[async_trait]
impl Controller for MemoryController {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn prepare(
        &self,
        container_id: &ContainerId,
        cgroup: &str,
        config: &ContainerConfig,
    ) -> Result<()> {
        if let Some(adj) = config.resources.oom_score_adj {
            self.oom_score_adjs
                .lock()
                .expect("oom score lock poisoned")
                .insert(container_id.clone(), adj);
        }

        // Kill the whole container on OOM rather than a single victim; a
        // partially killed container is useless to the agent.
        self.fs.write_control(cgroup, "memory.oom.group", "1")
    }

    async fn isolate(&self, container_id: &ContainerId, _cgroup: &str, pid: i32) -> Result<()> {
        let adj = self
            .oom_score_adjs
            .lock()
            .expect("oom score lock poisoned")
            .get(container_id)
            .copied();

        if let Some(adj) = adj {
            let path = format!("/proc/{pid}/oom_score_adj");
            std::fs::write(&path, adj.to_string()).map_err(|e| {
                crate::errors::IsolatorError::Filesystem(format!(
                    "Failed to write '{path}': {e}"
                ))
            })?;
        }
        Ok(())
    }

    async fn update(
        &self,
        _container_id: &ContainerId,
        cgroup: &str,
        requests: &Resources,
        limits: &Limits,
    ) -> Result<()> {
        if let Some(mem) = requests.mem {
            self.fs
                .write_control(cgroup, "memory.low", &mem.to_string())?;
        }

        let max = match limits.mem.or(requests.mem) {
            Some(mem) => mem.to_string(),
            None => "max".to_string(),
        };
        self.fs.write_control(cgroup, "memory.max", &max)
    }

    async fn watch(&self, container_id: &ContainerId, cgroup: &str) -> Result<Limitation> {
        let path = self.fs.path(cgroup).join("memory.events");
        let initial = self.oom_kills(cgroup).unwrap_or(0);

        let mut events = match self.watcher.add(&path) {
            Ok(events) => events,
            Err(e) => {
                debug!("Not watching memory events of container '{container_id}': {e}");
                return std::future::pending().await;
            }
        };

        while let Some(event) = events.recv().await {
            if event != watcher::Event::Modified {
                break;
            }
            if let Some(count) = self.oom_kills(cgroup)
                && count > initial
            {
                return Ok(Limitation {
                    controller: self.name().to_string(),
                    resource: "memory".to_string(),
                    message: format!(
                        "Memory limit exceeded: container '{container_id}' was OOM killed"
                    ),
                });
            }
        }

        // The cgroup is gone; nothing left to report.
        std::future::pending().await
    }

    async fn usage(&self, _container_id: &ContainerId, cgroup: &str) -> Result<ResourceStatistics> {
        let current = self.fs.read_control(cgroup, "memory.current")?;
        let total = current.trim().parse::<u64>().ok();

        let (anon, file) = match self.fs.read_control(cgroup, "memory.stat") {
            Ok(stat) => (stat_value(&stat, "anon"), stat_value(&stat, "file")),
            Err(_) => (None, None),
        };

        Ok(ResourceStatistics {
            mem_total_bytes: total,
            mem_anon_bytes: anon,
            mem_file_bytes: file,
            ..Default::default()
        })
    }

    async fn cleanup(&self, container_id: &ContainerId, _cgroup: &str) -> Result<()> {
        self.oom_score_adjs
            .lock()
            .expect("oom score lock poisoned")
            .remove(container_id);
        Ok(())
    }
}
