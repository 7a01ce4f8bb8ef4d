//! Pluggable cgroup v2 controllers
//!
//! One module per kernel controller plus the synthetic `core` controller
//! over the `cgroup.*` files. Every controller implements the same
//! operation contract and is driven by the isolator engine through a
//! name-keyed registry; controllers never create or remove cgroup
//! directories themselves.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cgroupfs::CgroupFs;
use crate::config::Flags;
use crate::container::{
    ContainerConfig, ContainerId, ContainerStatus, Limitation, Limits, ResourceStatistics,
    Resources,
};
use crate::errors::Result;

pub mod core;
pub mod cpu;
pub mod cpuset;
pub mod devices;
pub mod hugetlb;
pub mod io;
pub mod memory;
pub mod perf_event;
pub mod pids;

pub use devices::{DeviceManager, NoopDeviceManager};

/// Controllers that do not appear in `cgroup.controllers` and must never be
/// written into any `cgroup.subtree_control` file. They still participate
/// in every other hook.
pub const SKIP_SUBTREE_CONTROL: &[&str] = &["core", "perf_event", "devices"];

/// Operation contract every controller implements. All hooks receive the
/// container's non-leaf cgroup; most are no-ops for most controllers, so
/// the trait defaults them accordingly.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Identifying controller name.
    fn name(&self) -> &'static str;

    /// Set initial control files from the container config.
    async fn prepare(
        &self,
        _container_id: &ContainerId,
        _cgroup: &str,
        _config: &ContainerConfig,
    ) -> Result<()> {
        Ok(())
    }

    /// Controller-specific post-fork work. The launcher already placed the
    /// pid into the leaf cgroup.
    async fn isolate(&self, _container_id: &ContainerId, _cgroup: &str, _pid: i32) -> Result<()> {
        Ok(())
    }

    /// Reconcile in-memory state with an existing on-disk cgroup.
    async fn recover(&self, _container_id: &ContainerId, _cgroup: &str) -> Result<()> {
        Ok(())
    }

    /// Resolve with a `Limitation` when and only when the kernel reports a
    /// violation for this container. Controllers with nothing to report
    /// pend for the container's lifetime.
    async fn watch(&self, _container_id: &ContainerId, _cgroup: &str) -> Result<Limitation> {
        std::future::pending().await
    }

    /// Idempotent re-application of the quantitative policy.
    async fn update(
        &self,
        _container_id: &ContainerId,
        _cgroup: &str,
        _requests: &Resources,
        _limits: &Limits,
    ) -> Result<()> {
        Ok(())
    }

    /// The usage shard this controller owns.
    async fn usage(&self, _container_id: &ContainerId, _cgroup: &str) -> Result<ResourceStatistics> {
        Ok(ResourceStatistics::default())
    }

    /// The status shard this controller owns.
    async fn status(&self, _container_id: &ContainerId, _cgroup: &str) -> Result<ContainerStatus> {
        Ok(ContainerStatus::default())
    }

    /// Release controller-owned state. Cgroup directory removal is the
    /// engine's job.
    async fn cleanup(&self, _container_id: &ContainerId, _cgroup: &str) -> Result<()> {
        Ok(())
    }
}

/// Build the controller registry selected by the isolation flags. The
/// device manager is handed only to the `devices` controller.
pub fn create_controllers(
    flags: &Flags,
    fs: Arc<CgroupFs>,
    device_manager: Arc<dyn DeviceManager>,
) -> Result<HashMap<String, Arc<dyn Controller>>> {
    let mut controllers: HashMap<String, Arc<dyn Controller>> = HashMap::new();

    for name in flags.controller_names()? {
        let controller: Arc<dyn Controller> = match name.as_str() {
            "core" => Arc::new(core::CoreController::new(Arc::clone(&fs))),
            "cpu" => Arc::new(cpu::CpuController::new(Arc::clone(&fs))),
            "memory" => Arc::new(memory::MemoryController::new(Arc::clone(&fs))),
            "io" => Arc::new(io::IoController::new(Arc::clone(&fs))),
            "pids" => Arc::new(pids::PidsController::new(Arc::clone(&fs))),
            "cpuset" => Arc::new(cpuset::CpusetController::new(Arc::clone(&fs))),
            "hugetlb" => Arc::new(hugetlb::HugetlbController::new(Arc::clone(&fs))),
            "perf_event" => Arc::new(perf_event::PerfEventController::new()),
            "devices" => Arc::new(devices::DevicesController::new(Arc::clone(&device_manager))),
            other => {
                return Err(crate::errors::IsolatorError::InvalidController {
                    name: other.to_string(),
                    reason: "no such controller".to_string(),
                });
            }
        };
        controllers.insert(name, controller);
    }

    Ok(controllers)
}

/// Parse a `key value` stat file (`cpu.stat`, `memory.stat`,
/// `memory.events`, ...) into the value of one key.
pub(crate) fn stat_value(content: &str, key: &str) -> Option<u64> {
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some(key) {
            return parts.next()?.parse().ok();
        }
    }
    None
}
