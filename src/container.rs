//! Container identity, configuration, and resource types
//!
//! A `ContainerId` is a nestable identity: nested containers carry their
//! parent id, and the id chain maps reversibly onto the cgroup hierarchy so
//! that a filesystem sweep can recover the id from a directory path.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{IsolatorError, Result};

/// Name of the per-container leaf cgroup holding the container's processes.
pub const LEAF_CGROUP: &str = "leaf";

/// Name of the agent's own cgroup under the root; skipped in sweeps.
pub const AGENT_CGROUP: &str = "agent";

/// Hierarchical container identity supplied by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId {
    value: String,
    parent: Option<Box<ContainerId>>,
}

impl ContainerId {
    /// Create a top-level container id.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        Self::validate(&value)?;
        Ok(Self {
            value,
            parent: None,
        })
    }

    /// Create a nested container id under `parent`.
    pub fn nested(parent: ContainerId, value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        Self::validate(&value)?;
        Ok(Self {
            value,
            parent: Some(Box::new(parent)),
        })
    }

    fn validate(value: &str) -> Result<()> {
        if value.is_empty() {
            return Err(IsolatorError::InvalidConfig(
                "Container id cannot be empty".to_string(),
            ));
        }
        if value == LEAF_CGROUP || value == AGENT_CGROUP {
            return Err(IsolatorError::InvalidConfig(format!(
                "Container id '{value}' is reserved"
            )));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            || value == "."
            || value == ".."
        {
            return Err(IsolatorError::InvalidConfig(format!(
                "Container id '{value}' contains invalid characters"
            )));
        }
        Ok(())
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn parent(&self) -> Option<&ContainerId> {
        self.parent.as_deref()
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    /// Id chain from the top-level ancestor down to this id.
    pub fn chain(&self) -> Vec<&str> {
        let mut chain = Vec::new();
        let mut current = Some(self);
        while let Some(id) = current {
            chain.push(id.value.as_str());
            current = id.parent();
        }
        chain.reverse();
        chain
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.chain().join("/"))
    }
}

/// Cgroup (relative to the mount point) of a container: the non-leaf
/// `<root>/<id-chain>` or, with `leaf`, the `<root>/<id-chain>/leaf` cgroup
/// its processes live in.
pub fn container_cgroup(root: &str, container_id: &ContainerId, leaf: bool) -> String {
    let mut cgroup = root.trim_matches('/').to_string();
    for value in container_id.chain() {
        cgroup.push('/');
        cgroup.push_str(value);
    }
    if leaf {
        cgroup.push('/');
        cgroup.push_str(LEAF_CGROUP);
    }
    cgroup
}

/// Cgroup of the agent itself.
pub fn agent_cgroup(root: &str) -> String {
    format!("{}/{}", root.trim_matches('/'), AGENT_CGROUP)
}

/// Decode a cgroup path back into the `ContainerId` it was created for.
///
/// Returns `None` for the root itself, for anything outside the root, and
/// for paths containing reserved components (`leaf` cgroups, the agent's
/// cgroup) or components that are not valid container ids.
pub fn parse_container_id(root: &str, cgroup: &str) -> Option<ContainerId> {
    let root = root.trim_matches('/');
    let cgroup = cgroup.trim_matches('/');
    let stripped = cgroup.strip_prefix(root)?;
    if !stripped.is_empty() && !stripped.starts_with('/') {
        return None;
    }
    let relative = stripped.trim_matches('/');
    if relative.is_empty() {
        return None;
    }

    let mut container_id: Option<ContainerId> = None;
    for component in relative.split('/') {
        container_id = Some(match container_id {
            None => ContainerId::new(component).ok()?,
            Some(parent) => ContainerId::nested(parent, component).ok()?,
        });
    }
    container_id
}

/// Resource requests for a container, as supplied by the agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resources {
    /// Requested cpus; drives `cpu.weight`.
    pub cpus: Option<f64>,
    /// Requested memory in bytes; drives `memory.low`.
    pub mem: Option<u64>,
    /// Maximum number of processes; drives `pids.max`.
    pub pids: Option<u64>,
    /// Cpuset mask, e.g. `0-3,7`; drives `cpuset.cpus`.
    pub cpuset_cpus: Option<String>,
    /// IO weight (1-10000); drives `io.weight`.
    pub io_weight: Option<u32>,
    /// Per-page-size hugetlb limits in bytes, keyed by size label (`2MB`).
    pub hugetlb: BTreeMap<String, u64>,
    /// OOM score adjustment applied to the container's processes.
    pub oom_score_adj: Option<i32>,
}

/// Hard resource limits; anything unset falls back to the request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Limits {
    /// Hard cpu limit; drives `cpu.max`.
    pub cpus: Option<f64>,
    /// Hard memory limit in bytes; drives `memory.max`.
    pub mem: Option<u64>,
}

/// Linux-specific container settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinuxInfo {
    /// Whether a nested container shares its parent's cgroups. Defaults to
    /// true when unset.
    pub share_cgroups: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerInfo {
    pub linux_info: Option<LinuxInfo>,
}

/// Present for command tasks, where an executor re-execs the task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskInfo {
    /// User the task command runs as, if set by the framework.
    pub command_user: Option<String>,
}

/// Configuration the agent supplies with `prepare`.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub user: Option<String>,
    pub rootfs: Option<PathBuf>,
    pub container_info: Option<ContainerInfo>,
    pub task_info: Option<TaskInfo>,
    pub resources: Resources,
    pub limits: Limits,
}

impl ContainerConfig {
    /// Resolve the `share_cgroups` flag, defaulting to true when unset.
    pub fn share_cgroups(&self) -> bool {
        self.container_info
            .as_ref()
            .and_then(|info| info.linux_info.as_ref())
            .and_then(|linux| linux.share_cgroups)
            .unwrap_or(true)
    }
}

/// Checkpointed container state handed to `recover`.
#[derive(Debug, Clone)]
pub struct ContainerState {
    pub container_id: ContainerId,
    pub container_info: Option<ContainerInfo>,
}

impl ContainerState {
    pub fn share_cgroups(&self) -> bool {
        self.container_info
            .as_ref()
            .and_then(|info| info.linux_info.as_ref())
            .and_then(|linux| linux.share_cgroups)
            .unwrap_or(true)
    }
}

/// Resource-violation event reported to the agent; at most one is delivered
/// per container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limitation {
    pub controller: String,
    pub resource: String,
    pub message: String,
}

/// Usage statistics merged across controllers. Each controller fills the
/// fields it owns; unready shards leave theirs unset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceStatistics {
    pub cpus_user_time_secs: Option<f64>,
    pub cpus_system_time_secs: Option<f64>,
    pub cpus_nr_throttled: Option<u64>,
    pub cpus_throttled_time_secs: Option<f64>,
    pub mem_total_bytes: Option<u64>,
    pub mem_anon_bytes: Option<u64>,
    pub mem_file_bytes: Option<u64>,
    pub io_read_bytes: Option<u64>,
    pub io_write_bytes: Option<u64>,
    pub io_read_ops: Option<u64>,
    pub io_write_ops: Option<u64>,
    pub processes: Option<u64>,
    pub threads: Option<u64>,
    pub hugetlb_bytes: BTreeMap<String, u64>,
}

impl ResourceStatistics {
    /// Overlay another shard onto this one; set fields win.
    pub fn merge(&mut self, other: ResourceStatistics) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(cpus_user_time_secs);
        take!(cpus_system_time_secs);
        take!(cpus_nr_throttled);
        take!(cpus_throttled_time_secs);
        take!(mem_total_bytes);
        take!(mem_anon_bytes);
        take!(mem_file_bytes);
        take!(io_read_bytes);
        take!(io_write_bytes);
        take!(io_read_ops);
        take!(io_write_ops);
        take!(processes);
        take!(threads);
        self.hugetlb_bytes.extend(other.hugetlb_bytes);
    }
}

/// Structured status merged across controllers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerStatus {
    /// The container's non-leaf cgroup.
    pub cgroup: Option<String>,
    /// Whether the cgroup is currently frozen (`cgroup.events`).
    pub frozen: Option<bool>,
    /// Whether any process lives in the subtree (`cgroup.events`).
    pub populated: Option<bool>,
    /// Effective cpuset mask (`cpuset.cpus.effective`).
    pub cpuset_effective: Option<String>,
}

impl ContainerStatus {
    pub fn merge(&mut self, other: ContainerStatus) {
        if other.cgroup.is_some() {
            self.cgroup = other.cgroup;
        }
        if other.frozen.is_some() {
            self.frozen = other.frozen;
        }
        if other.populated.is_some() {
            self.populated = other.populated;
        }
        if other.cpuset_effective.is_some() {
            self.cpuset_effective = other.cpuset_effective;
        }
    }
}

/// Namespaces the launcher should clone for the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneNamespace {
    Cgroup,
    Mount,
}

/// A mount the launcher should apply inside the container's mount namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub bind: bool,
    pub recursive: bool,
}

/// Launch directives returned from `prepare` when the container has a
/// rootfs. For command tasks the directives are wrapped into an envelope
/// whose only content is a `--task_launch_info=<json>` argument, so the
/// executor does not apply the mounts and the task does.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerLaunchInfo {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clone_namespaces: Vec<CloneNamespace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<ContainerMount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command_arguments: Vec<String>,
}
