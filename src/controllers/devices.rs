//! `devices` controller
//!
//! Device access control in cgroup v2 is enforced through BPF programs, not
//! control files, and the BPF machinery belongs to the agent's device
//! manager. This controller is the seam: it keeps device isolation on the
//! per-container controller set and delegates the actual work.

use std::sync::Arc;

use async_trait::async_trait;

use super::Controller;
use crate::container::{ContainerConfig, ContainerId, ContainerState};
use crate::errors::Result;

/// External collaborator managing device access (BPF attach/detach). The
/// agent supplies an implementation; `NoopDeviceManager` serves agents that
/// do not isolate devices.
#[async_trait]
pub trait DeviceManager: Send + Sync {
    /// Install the device policy for a freshly prepared container.
    async fn configure(
        &self,
        container_id: &ContainerId,
        cgroup: &str,
        config: &ContainerConfig,
    ) -> Result<()>;

    /// Drop the device policy of a container being cleaned up.
    async fn remove(&self, container_id: &ContainerId) -> Result<()>;

    /// Reconcile device state for checkpointed containers after a restart.
    async fn recover(&self, states: &[ContainerState]) -> Result<()>;
}

pub struct NoopDeviceManager;

#[async_trait]
impl DeviceManager for NoopDeviceManager {
    async fn configure(
        &self,
        _container_id: &ContainerId,
        _cgroup: &str,
        _config: &ContainerConfig,
    ) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _container_id: &ContainerId) -> Result<()> {
        Ok(())
    }

    async fn recover(&self, _states: &[ContainerState]) -> Result<()> {
        Ok(())
    }
}

pub struct DevicesController {
    device_manager: Arc<dyn DeviceManager>,
}

impl DevicesController {
    pub fn new(device_manager: Arc<dyn DeviceManager>) -> Self {
        Self { device_manager }
    }
}

#[async_trait]
impl Controller for DevicesController {
    fn name(&self) -> &'static str {
        "devices"
    }

    async fn prepare(
        &self,
        container_id: &ContainerId,
        cgroup: &str,
        config: &ContainerConfig,
    ) -> Result<()> {
        self.device_manager
            .configure(container_id, cgroup, config)
            .await
    }

    async fn cleanup(&self, container_id: &ContainerId, _cgroup: &str) -> Result<()> {
        self.device_manager.remove(container_id).await
    }
}
