//! cgroups2-isolator: cgroups v2 container isolation in Rust
//!
//! Attaches every container a Linux container-orchestration agent launches
//! to a dedicated cgroup in the unified hierarchy, configures the kernel
//! resource controllers from the container's requests and limits, streams
//! usage statistics back, reacts to kernel-reported resource exhaustion,
//! and reliably tears cgroups down across agent crashes and restarts.
//!
//! # Modules
//!
//! - **cgroupfs**: facade over the mounted unified hierarchy
//! - **controllers**: one module per kernel controller plus the synthetic
//!   `core` controller, behind a uniform operation contract
//! - **isolator**: per-container lifecycle engine and the agent-facing
//!   hook protocol, including recovery and orphan cleanup
//! - **watcher**: control-file watcher backing limitation delivery
//!
//! # Example
//!
//! ```ignore
//! use cgroups2_isolator::{Cgroups2Isolator, ContainerConfig, ContainerId, Flags, Isolator};
//!
//! let isolator = Cgroups2Isolator::new(Flags::default())?;
//! let container_id = ContainerId::new("c1")?;
//!
//! isolator.prepare(&container_id, &ContainerConfig::default()).await?;
//! isolator.isolate(&container_id, pid).await?;
//! let limitation = isolator.watch(&container_id).await?;
//! ```

// Core modules
pub mod config;
pub mod container;
pub mod errors;

// Layered modules
pub mod cgroupfs;
pub mod controllers;
pub mod watcher;

// Engine
pub mod isolator;

// Public API
pub use cgroupfs::CgroupFs;
pub use config::Flags;
pub use container::{
    ContainerConfig, ContainerId, ContainerLaunchInfo, ContainerState, ContainerStatus,
    Limitation, Limits, ResourceStatistics, Resources,
};
pub use controllers::{Controller, DeviceManager, NoopDeviceManager};
pub use errors::{IsolatorError, Result};
pub use isolator::{Cgroups2Isolator, Isolator};
