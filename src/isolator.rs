//! Isolator engine
//!
//! Per-container cgroup lifecycle woven through the agent's isolator hook
//! protocol: prepare, isolate, watch, update, usage, status, cleanup, and
//! recovery with orphan sweep. The engine owns the `Info` table and is the
//! sole creator and destroyer of container cgroup directories; controllers
//! own the control files of their kernel controller.
//!
//! All public operations serialize against the engine state behind one
//! async mutex. Concurrency comes from fanning controller operations out
//! and awaiting their collective completion before the next transition;
//! the kill-and-drain destroy runs with the table released so other
//! containers keep making progress, and `abort` discards in-flight
//! controller operations.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;

use crate::cgroupfs::CgroupFs;
use crate::config::Flags;
use crate::container::{
    ContainerConfig, ContainerId, ContainerLaunchInfo, ContainerMount, ContainerState,
    ContainerStatus, CloneNamespace, Limitation, Limits, ResourceStatistics, Resources,
    agent_cgroup, container_cgroup, parse_container_id,
};
use crate::controllers::{
    Controller, DeviceManager, NoopDeviceManager, SKIP_SUBTREE_CONTROL, create_controllers,
};
use crate::errors::{IsolatorError, Result};

/// The isolator hook protocol the agent drives.
#[async_trait]
pub trait Isolator: Send + Sync {
    fn supports_nesting(&self) -> bool {
        false
    }

    fn supports_standalone(&self) -> bool {
        false
    }

    /// Rebuild state from checkpointed containers and destroy orphans.
    async fn recover(
        &self,
        states: &[ContainerState],
        orphans: &HashSet<ContainerId>,
    ) -> Result<()>;

    /// Create and configure the container's cgroups; returns launch
    /// directives when the container has a rootfs.
    async fn prepare(
        &self,
        container_id: &ContainerId,
        config: &ContainerConfig,
    ) -> Result<Option<ContainerLaunchInfo>>;

    /// Controller-specific post-fork work; the launcher has already placed
    /// `pid` into the container's leaf cgroup.
    async fn isolate(&self, container_id: &ContainerId, pid: i32) -> Result<()>;

    /// Subscribe to the container's resource-limitation event. At most one
    /// `Limitation` is ever delivered per container.
    async fn watch(&self, container_id: &ContainerId) -> Result<oneshot::Receiver<Limitation>>;

    /// Re-apply the quantitative resource policy.
    async fn update(
        &self,
        container_id: &ContainerId,
        requests: &Resources,
        limits: &Limits,
    ) -> Result<()>;

    /// Usage snapshot merged across controllers; failed shards are skipped.
    async fn usage(&self, container_id: &ContainerId) -> Result<ResourceStatistics>;

    /// Structured status merged across controllers; failed shards are
    /// skipped.
    async fn status(&self, container_id: &ContainerId) -> Result<ContainerStatus>;

    /// Tear down the container's cgroups and release its state.
    async fn cleanup(&self, container_id: &ContainerId) -> Result<()>;
}

/// Per-container engine state. Present exactly for containers that own
/// their cgroups (and for recovered orphans); nested containers sharing
/// their parent's cgroups are resolved through the parent chain instead.
struct Info {
    /// Non-leaf cgroup `<root>/<id-chain>`.
    cgroup: String,
    /// Leaf cgroup `<root>/<id-chain>/leaf` holding the processes.
    cgroup_leaf: String,
    /// Controllers participating in this container's hooks.
    controllers: HashSet<String>,
    /// Whether this container owns its cgroups.
    isolate: bool,
    /// Sending half of the one-shot limitation promise; taken by the first
    /// controller watch that resolves.
    limitation_tx: Option<oneshot::Sender<Limitation>>,
    /// Receiving half; handed out by `watch`.
    limitation_rx: Option<oneshot::Receiver<Limitation>>,
    /// Controller watch tasks, aborted on cleanup.
    watchers: Vec<JoinHandle<()>>,
}

type InfoTable = HashMap<ContainerId, Info>;

/// Walk up the parent chain to the `Info` owning this container's cgroups.
fn cgroup_info<'a>(state: &'a InfoTable, container_id: &ContainerId) -> Option<&'a Info> {
    let mut current = Some(container_id);
    while let Some(id) = current {
        if let Some(found) = state.get(id) {
            return Some(found);
        }
        current = id.parent();
    }
    None
}

fn owning_id(state: &InfoTable, container_id: &ContainerId) -> Option<ContainerId> {
    let mut current = Some(container_id);
    while let Some(id) = current {
        if state.contains_key(id) {
            return Some(id.clone());
        }
        current = id.parent();
    }
    None
}

fn fan_in(operation: &'static str, results: Vec<(&str, Result<()>)>) -> Result<()> {
    let errors: Vec<String> = results
        .into_iter()
        .filter_map(|(name, result)| result.err().map(|e| format!("{name}: {e}")))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(IsolatorError::ControllerFailures { operation, errors })
    }
}

/// cgroups v2 isolator engine.
pub struct Cgroups2Isolator {
    flags: Flags,
    fs: Arc<CgroupFs>,
    controllers: HashMap<String, Arc<dyn Controller>>,
    device_manager: Arc<dyn DeviceManager>,
    state: Arc<Mutex<InfoTable>>,
    aborted: watch::Sender<bool>,
}

impl Cgroups2Isolator {
    /// Engine over the standard cgroup2 mount without device isolation.
    pub fn new(flags: Flags) -> Result<Self> {
        Self::with_fs(flags, Arc::new(CgroupFs::new()), Arc::new(NoopDeviceManager))
    }

    /// Engine over an explicit mount and device manager.
    pub fn with_fs(
        flags: Flags,
        fs: Arc<CgroupFs>,
        device_manager: Arc<dyn DeviceManager>,
    ) -> Result<Self> {
        let controllers = create_controllers(&flags, Arc::clone(&fs), Arc::clone(&device_manager))?;
        Ok(Self::with_controllers(flags, fs, controllers, device_manager))
    }

    /// Engine over an explicit controller registry.
    pub fn with_controllers(
        flags: Flags,
        fs: Arc<CgroupFs>,
        controllers: HashMap<String, Arc<dyn Controller>>,
        device_manager: Arc<dyn DeviceManager>,
    ) -> Self {
        Self {
            flags,
            fs,
            controllers,
            device_manager,
            state: Arc::new(Mutex::new(HashMap::new())),
            aborted: watch::channel(false).0,
        }
    }

    /// Cooperative cancellation: every in-flight and subsequent controller
    /// operation resolves as `Discarded` and is rolled into the combined
    /// failure of its fan-out. On-disk state is left best-effort
    /// consistent; the next recovery repairs it.
    pub fn abort(&self) {
        // send_replace updates the value even while no operation is
        // subscribed, so an early abort still discards later fan-outs.
        let _ = self.aborted.send_replace(true);
    }

    // Race an operation against the abort signal; the discard wins.
    async fn discardable<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        let mut aborted = self.aborted.subscribe();
        tokio::select! {
            biased;
            _ = aborted.wait_for(|aborted| *aborted) => Err(IsolatorError::Discarded),
            result = operation => result,
        }
    }

    fn root(&self) -> &str {
        &self.flags.cgroups_root
    }

    /// Enable `name` in `cgroup.subtree_control` at every hop below the
    /// root down to (and including) the non-leaf. The root's own subtree
    /// control is the agent bootstrap's responsibility.
    fn enable_along_path(&self, name: &str, non_leaf: &str) -> Result<()> {
        let root = self.root().trim_matches('/');
        let relative = non_leaf
            .trim_matches('/')
            .strip_prefix(root)
            .unwrap_or("")
            .trim_matches('/');

        let mut current = root.to_string();
        for token in relative.split('/').filter(|token| !token.is_empty()) {
            current = format!("{current}/{token}");
            self.fs.enable_controllers(&current, &[name])?;
        }
        Ok(())
    }

    async fn update_controllers(
        &self,
        container_id: &ContainerId,
        engine_info: &Info,
        requests: &Resources,
        limits: &Limits,
    ) -> Result<()> {
        info!("Updating controllers for cgroup '{}'", engine_info.cgroup);

        let mut updates = Vec::new();
        for (name, controller) in &self.controllers {
            if !engine_info.controllers.contains(name.as_str()) {
                continue;
            }
            updates.push(async move {
                (
                    name.as_str(),
                    self.discardable(controller.update(
                        container_id,
                        &engine_info.cgroup,
                        requests,
                        limits,
                    ))
                    .await,
                )
            });
        }

        fan_in("update", join_all(updates).await)
    }

    fn launch_info(
        &self,
        state: &InfoTable,
        container_id: &ContainerId,
        config: &ContainerConfig,
    ) -> Result<Option<ContainerLaunchInfo>> {
        // Only containers with a rootfs get cgroup mounts.
        let Some(rootfs) = &config.rootfs else {
            return Ok(None);
        };

        let engine_info = cgroup_info(state, container_id)
            .ok_or_else(|| IsolatorError::UnknownContainer(container_id.clone()))?;

        // A new cgroup namespace so the container only sees its own
        // subtree, and a new mount namespace carrying its leaf at the
        // canonical mount point.
        let launch_info = ContainerLaunchInfo {
            clone_namespaces: vec![CloneNamespace::Cgroup, CloneNamespace::Mount],
            mounts: vec![ContainerMount {
                source: self.fs.path(&engine_info.cgroup_leaf),
                target: rootfs.join("sys/fs/cgroup"),
                bind: true,
                recursive: true,
            }],
            command_arguments: Vec::new(),
        };

        // For a command task the mounts must land in the task's mount
        // namespace, not the executor's, where the sysfs mounts done at
        // executor launch would shadow them. Hand them over as a launch
        // argument for the executor to apply when it launches the task.
        if config.task_info.is_some() {
            let envelope = ContainerLaunchInfo {
                command_arguments: vec![format!(
                    "--task_launch_info={}",
                    serde_json::to_string(&launch_info)?
                )],
                ..Default::default()
            };
            return Ok(Some(envelope));
        }

        Ok(Some(launch_info))
    }

    fn chown_leaf(&self, container_id: &ContainerId, leaf: &str, config: &ContainerConfig) -> Result<()> {
        // Chown the leaf so an executor or a self-managing payload can
        // create sub-cgroups. Non-recursive: the control files stay owned
        // by the agent user.
        if !self.flags.switch_user || config.user.is_none() {
            return Ok(());
        }

        let user = if config.task_info.is_some() && config.rootfs.is_some() {
            // Command task with a rootfs: the executor runs as root while
            // the task runs as the task command's user, which the
            // framework may have left unset.
            config
                .task_info
                .as_ref()
                .and_then(|task| task.command_user.clone())
        } else {
            config.user.clone()
        };

        match user {
            Some(user) => {
                debug!(
                    "Chowning cgroup '{leaf}' to user '{user}' for container '{container_id}'"
                );
                self.fs.chown(leaf, &user)
            }
            None => {
                debug!(
                    "Container '{container_id}' is a command task with a rootfs but no task \
                     command user; leaving its cgroup owned by the agent"
                );
                Ok(())
            }
        }
    }

    // Rebuild one container's `Info` from its on-disk cgroups. Does not
    // touch the info table, so recoveries can run concurrently; the caller
    // inserts the result.
    async fn recover_container(&self, container_id: &ContainerId) -> Result<Info> {
        // Possible invalid states after an unclean shutdown: a crash during
        // launch can leave cgroups half-created, a crash during destroy can
        // leave orphans, and a restart with different isolation flags can
        // leave controllers unenabled. Missing cgroups are recreated so the
        // container can be destroyed through the uniform cleanup path.
        let non_leaf = container_cgroup(self.root(), container_id, false);
        let leaf = container_cgroup(self.root(), container_id, true);

        if !self.fs.exists(&non_leaf) {
            warn!(
                "Container '{container_id}' is missing the cgroup '{non_leaf}'; creating it"
            );
            self.fs.create(&non_leaf, true)?;
        }
        if !self.fs.exists(&leaf) {
            warn!("Container '{container_id}' is missing the cgroup '{leaf}'; creating it");
            self.fs.create(&leaf, true)?;
        }

        let enabled = self.fs.enabled_controllers(&non_leaf)?;

        let mut recovers = Vec::new();
        let mut recovered: HashSet<String> = HashSet::new();
        for (name, controller) in &self.controllers {
            if !enabled.contains(name.as_str()) {
                warn!(
                    "Controller '{name}' is configured but not enabled for container \
                     '{container_id}'"
                );
                continue;
            }
            recovered.insert(name.clone());
            let cgroup = non_leaf.as_str();
            recovers.push(async move {
                (
                    name.as_str(),
                    self.discardable(controller.recover(container_id, cgroup)).await,
                )
            });
        }

        fan_in("recover", join_all(recovers).await)?;

        let (limitation_tx, limitation_rx) = oneshot::channel();
        Ok(Info {
            cgroup: non_leaf,
            cgroup_leaf: leaf,
            controllers: recovered,
            isolate: true,
            limitation_tx: Some(limitation_tx),
            limitation_rx: Some(limitation_rx),
            watchers: Vec::new(),
        })
    }

    // Recover a batch of containers concurrently and insert the survivors;
    // failures come back as `id: cause` strings for the combined error.
    async fn recover_batch(
        &self,
        state: &mut InfoTable,
        container_ids: Vec<&ContainerId>,
    ) -> Vec<String> {
        let mut recovers = Vec::new();
        for container_id in container_ids {
            recovers.push(async move {
                (
                    container_id,
                    self.discardable(self.recover_container(container_id)).await,
                )
            });
        }

        let mut errors = Vec::new();
        for (container_id, result) in join_all(recovers).await {
            match result {
                Ok(info) => {
                    state.insert(container_id.clone(), info);
                }
                Err(e) => errors.push(format!("{container_id}: {e}")),
            }
        }
        errors
    }
}

#[async_trait]
impl Isolator for Cgroups2Isolator {
    fn supports_nesting(&self) -> bool {
        true
    }

    fn supports_standalone(&self) -> bool {
        true
    }

    async fn recover(
        &self,
        states: &[ContainerState],
        orphans: &HashSet<ContainerId>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;

        // Containers from checkpointed data first, recovered concurrently.
        // Nested containers that share their parent's cgroups have no
        // cgroups of their own and nothing to recover.
        let mut checkpointed = Vec::new();
        for checkpoint in states {
            let container_id = &checkpoint.container_id;
            if container_id.has_parent() && checkpoint.share_cgroups() {
                debug!(
                    "Skipping recovery of container '{container_id}' sharing its parent's cgroups"
                );
                continue;
            }
            if state.contains_key(container_id) {
                continue;
            }
            checkpointed.push(container_id);
        }

        let errors = self.recover_batch(&mut state, checkpointed).await;
        if !errors.is_empty() {
            return Err(IsolatorError::RecoveryFailed(format!(
                "Failed to recover active containers: {}",
                errors.join(", ")
            )));
        }

        // Then containers found in the hierarchy. Known orphans will be
        // destroyed by the agent through the normal cleanup path; unknown
        // orphans are nobody else's to destroy and are cleaned up here.
        let agent = agent_cgroup(self.root());
        let mut known_orphans = Vec::new();
        let mut unknown_orphans = Vec::new();
        for cgroup in self.fs.list_descendants(self.root())? {
            if cgroup == agent || cgroup.starts_with(&format!("{agent}/")) {
                continue;
            }
            let Some(container_id) = parse_container_id(self.root(), &cgroup) else {
                info!(
                    "Cgroup '{cgroup}' does not correspond to a container id and will not be \
                     recovered"
                );
                continue;
            };
            if state.contains_key(&container_id) {
                continue;
            }
            if orphans.contains(&container_id) {
                known_orphans.push(container_id);
            } else {
                unknown_orphans.push(container_id);
            }
        }

        let orphaned = known_orphans.iter().chain(unknown_orphans.iter()).collect();
        let errors = self.recover_batch(&mut state, orphaned).await;
        if !errors.is_empty() {
            return Err(IsolatorError::RecoveryFailed(format!(
                "Failed to recover orphan containers: {}",
                errors.join(", ")
            )));
        }

        self.device_manager.recover(states).await?;

        drop(state);

        for container_id in &unknown_orphans {
            info!("Cleaning up unknown orphaned container '{container_id}'");
            if let Err(e) = self.cleanup(container_id).await {
                warn!("Failed to clean up unknown orphaned container '{container_id}': {e}");
            }
        }

        Ok(())
    }

    async fn prepare(
        &self,
        container_id: &ContainerId,
        config: &ContainerConfig,
    ) -> Result<Option<ContainerLaunchInfo>> {
        let mut state = self.state.lock().await;

        if state.contains_key(container_id) {
            return Err(IsolatorError::AlreadyPrepared(container_id.clone()));
        }

        // The agent bootstrap establishes the root cgroup together with its
        // subtree control. Recreating it here would leave every future
        // container without controllers, so its absence is unrecoverable
        // in-process.
        if !self.fs.exists(self.root()) {
            return Err(IsolatorError::MissingRoot(self.root().to_string()));
        }

        let share_cgroups = container_id.has_parent() && config.share_cgroups();
        if share_cgroups {
            // The container lives in its owning ancestor's cgroups: nothing
            // to create, no Info of its own, resource operations resolve
            // through the parent chain.
            return self.launch_info(&state, container_id, config);
        }

        let non_leaf = container_cgroup(self.root(), container_id, false);
        let leaf = container_cgroup(self.root(), container_id, true);
        for cgroup in [&non_leaf, &leaf] {
            if self.fs.exists(cgroup) {
                return Err(IsolatorError::Filesystem(format!(
                    "Cgroup '{cgroup}' already exists"
                )));
            }
        }
        self.fs.create(&non_leaf, true)?;
        self.fs.create(&leaf, true)?;
        info!("Created cgroups '{non_leaf}' and '{leaf}'");

        let (limitation_tx, limitation_rx) = oneshot::channel();
        state.insert(
            container_id.clone(),
            Info {
                cgroup: non_leaf.clone(),
                cgroup_leaf: leaf.clone(),
                controllers: self.controllers.keys().cloned().collect(),
                isolate: true,
                limitation_tx: Some(limitation_tx),
                limitation_rx: Some(limitation_rx),
                watchers: Vec::new(),
            },
        );

        // Enable every controller at each hop down to the non-leaf, but
        // never in the leaf: with controllers enabled there, writing the
        // container pid to the leaf's cgroup.procs would violate the
        // no-internal-processes rule and fail. A payload that wants to
        // self-manage cgroups has to create a sub-cgroup of the leaf, move
        // itself in, and enable controllers in the leaf afterwards.
        for name in self.controllers.keys() {
            if SKIP_SUBTREE_CONTROL.contains(&name.as_str()) {
                // Absent from cgroup.controllers; cannot be written into
                // subtree_control but still participates in all hooks.
                continue;
            }
            self.enable_along_path(name, &non_leaf)?;
        }

        self.chown_leaf(container_id, &leaf, config)?;

        let engine_info = state.get(container_id).expect("info just inserted");
        let mut prepares = Vec::new();
        for (name, controller) in &self.controllers {
            let cgroup = engine_info.cgroup.as_str();
            prepares.push(async move {
                (
                    name.as_str(),
                    self.discardable(controller.prepare(container_id, cgroup, config))
                        .await,
                )
            });
        }
        fan_in("prepare", join_all(prepares).await)?;

        self.update_controllers(container_id, engine_info, &config.resources, &config.limits)
            .await?;

        self.launch_info(&state, container_id, config)
    }

    async fn isolate(&self, container_id: &ContainerId, pid: i32) -> Result<()> {
        let state = self.state.lock().await;

        let Some(engine_info) = state.get(container_id) else {
            // A nested container sharing its parent's cgroups: the launcher
            // placed the pid in the owner's leaf and there is nothing to do.
            return if cgroup_info(&state, container_id).is_some() {
                Ok(())
            } else {
                Err(IsolatorError::UnknownContainer(container_id.clone()))
            };
        };

        if !engine_info.isolate {
            return Ok(());
        }

        let mut isolates = Vec::new();
        for (name, controller) in &self.controllers {
            if !engine_info.controllers.contains(name.as_str()) {
                continue;
            }
            let cgroup = engine_info.cgroup.as_str();
            isolates.push(async move {
                (
                    name.as_str(),
                    self.discardable(controller.isolate(container_id, cgroup, pid))
                        .await,
                )
            });
        }

        fan_in("isolate", join_all(isolates).await)
    }

    async fn watch(&self, container_id: &ContainerId) -> Result<oneshot::Receiver<Limitation>> {
        let mut state = self.state.lock().await;

        let owner = owning_id(&state, container_id)
            .ok_or_else(|| IsolatorError::UnknownContainer(container_id.clone()))?;

        let engine_info = state.get_mut(&owner).expect("owner resolved above");
        let limitation_rx = engine_info
            .limitation_rx
            .take()
            .ok_or_else(|| IsolatorError::AlreadyWatched(owner.clone()))?;
        let cgroup = engine_info.cgroup.clone();
        let names: Vec<String> = engine_info.controllers.iter().cloned().collect();

        let mut handles = Vec::new();
        for name in names {
            let Some(controller) = self.controllers.get(&name) else {
                continue;
            };
            let controller = Arc::clone(controller);
            let state_ref = Arc::clone(&self.state);
            let watched_id = owner.clone();
            let cgroup = cgroup.clone();

            handles.push(tokio::spawn(async move {
                match controller.watch(&watched_id, &cgroup).await {
                    Ok(limitation) => {
                        let mut state = state_ref.lock().await;
                        if let Some(engine_info) = state.get_mut(&watched_id)
                            && let Some(limitation_tx) = engine_info.limitation_tx.take()
                        {
                            info!(
                                "Container '{watched_id}' reached a '{}' limitation: {}",
                                limitation.controller, limitation.message
                            );
                            let _ = limitation_tx.send(limitation);
                        }
                        // Later resolutions find the promise gone and are
                        // dropped; at most one limitation per container.
                    }
                    Err(e) => {
                        warn!(
                            "Watching controller '{}' of container '{watched_id}' failed: {e}",
                            controller.name()
                        );
                    }
                }
            }));
        }

        let engine_info = state.get_mut(&owner).expect("owner resolved above");
        engine_info.watchers.extend(handles);

        Ok(limitation_rx)
    }

    async fn update(
        &self,
        container_id: &ContainerId,
        requests: &Resources,
        limits: &Limits,
    ) -> Result<()> {
        let state = self.state.lock().await;

        let Some(engine_info) = state.get(container_id) else {
            return if cgroup_info(&state, container_id).is_some() {
                Err(IsolatorError::UpdateNotSupported)
            } else {
                Err(IsolatorError::UnknownContainer(container_id.clone()))
            };
        };

        if !engine_info.isolate {
            return Err(IsolatorError::UpdateNotSupported);
        }

        self.update_controllers(container_id, engine_info, requests, limits)
            .await
    }

    async fn usage(&self, container_id: &ContainerId) -> Result<ResourceStatistics> {
        let state = self.state.lock().await;

        let engine_info = cgroup_info(&state, container_id)
            .ok_or_else(|| IsolatorError::UnknownContainer(container_id.clone()))?;

        let mut usages = Vec::new();
        for (name, controller) in &self.controllers {
            if !engine_info.controllers.contains(name.as_str()) {
                continue;
            }
            let cgroup = engine_info.cgroup.as_str();
            usages.push(async move {
                (
                    name.as_str(),
                    self.discardable(controller.usage(container_id, cgroup)).await,
                )
            });
        }

        let mut statistics = ResourceStatistics::default();
        for (name, result) in join_all(usages).await {
            match result {
                Ok(shard) => statistics.merge(shard),
                Err(e) => warn!(
                    "Skipping resource statistics of controller '{name}' for container \
                     '{container_id}': {e}"
                ),
            }
        }
        Ok(statistics)
    }

    async fn status(&self, container_id: &ContainerId) -> Result<ContainerStatus> {
        let state = self.state.lock().await;

        let engine_info = cgroup_info(&state, container_id)
            .ok_or_else(|| IsolatorError::UnknownContainer(container_id.clone()))?;

        let mut statuses = Vec::new();
        for (name, controller) in &self.controllers {
            if !engine_info.controllers.contains(name.as_str()) {
                continue;
            }
            let cgroup = engine_info.cgroup.as_str();
            statuses.push(async move {
                (
                    name.as_str(),
                    self.discardable(controller.status(container_id, cgroup)).await,
                )
            });
        }

        let mut status = ContainerStatus::default();
        for (name, result) in join_all(statuses).await {
            match result {
                Ok(shard) => status.merge(shard),
                Err(e) => warn!(
                    "Skipping status of controller '{name}' for container '{container_id}': {e}"
                ),
            }
        }
        Ok(status)
    }

    async fn cleanup(&self, container_id: &ContainerId) -> Result<()> {
        let state = self.state.lock().await;

        let Some(engine_info) = state.get(container_id) else {
            debug!("Ignoring cleanup request for unknown container '{container_id}'");
            return Ok(());
        };
        let cgroup = engine_info.cgroup.clone();
        let names: Vec<String> = engine_info.controllers.iter().cloned().collect();

        // Release the table while the controllers clean up and the subtree
        // drains: destroy polls for up to the full timeout and must not
        // stall operations on other containers.
        drop(state);

        let mut cleanups = Vec::new();
        for name in &names {
            let Some(controller) = self.controllers.get(name) else {
                continue;
            };
            let cgroup = cgroup.as_str();
            cleanups.push(async move {
                (
                    name.as_str(),
                    self.discardable(controller.cleanup(container_id, cgroup))
                        .await,
                )
            });
        }
        fan_in("cleanup", join_all(cleanups).await)?;

        // Destroy the on-disk cgroups before erasing the info: a failed
        // destroy keeps the info so the agent can retry.
        if self.fs.exists(&cgroup) {
            self.discardable(self.fs.destroy(&cgroup, self.flags.destroy_timeout))
                .await?;
        }

        let mut state = self.state.lock().await;
        if let Some(engine_info) = state.remove(container_id) {
            for watcher in engine_info.watchers {
                watcher.abort();
            }
        }
        Ok(())
    }
}
