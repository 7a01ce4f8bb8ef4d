//! Integration tests for cgroups2-isolator
//!
//! These tests drive the engine end to end against a tempdir-backed
//! hierarchy: the facade seeds the `cgroup.*` files that the kernel would
//! provide on real cgroupfs, so every lifecycle path (prepare, isolate,
//! update, watch, recovery, orphan sweep, cleanup) runs unmodified.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio::time::timeout;

use cgroups2_isolator::container::{ContainerInfo, LinuxInfo, TaskInfo};
use cgroups2_isolator::{
    CgroupFs, Cgroups2Isolator, ContainerConfig, ContainerId, ContainerState, Controller, Flags,
    Isolator, IsolatorError, Limits, NoopDeviceManager, Resources,
};

const ROOT: &str = "containers";
const ROOT_CONTROLLERS: &str = "cpu cpuset hugetlb io memory pids";

/// What the agent bootstrap does before the isolator starts: the root
/// cgroup exists, its controllers are available, and its subtree control
/// is established.
fn bootstrap(mount: &Path) {
    fs::create_dir_all(mount.join(ROOT).join("agent")).unwrap();
    fs::write(mount.join(ROOT).join("cgroup.controllers"), ROOT_CONTROLLERS).unwrap();
    fs::write(
        mount.join(ROOT).join("cgroup.subtree_control"),
        ROOT_CONTROLLERS,
    )
    .unwrap();
}

fn flags(isolation: &str) -> Flags {
    Flags {
        cgroups_root: ROOT.to_string(),
        isolation: isolation.to_string(),
        switch_user: false,
        destroy_timeout: Duration::from_secs(2),
    }
}

fn isolator(mount: &Path, isolation: &str) -> Cgroups2Isolator {
    Cgroups2Isolator::with_fs(
        flags(isolation),
        Arc::new(CgroupFs::with_mount(mount)),
        Arc::new(NoopDeviceManager),
    )
    .unwrap()
}

fn id(value: &str) -> ContainerId {
    ContainerId::new(value).unwrap()
}

fn nested(parent: &ContainerId, value: &str) -> ContainerId {
    ContainerId::nested(parent.clone(), value).unwrap()
}

fn share_cgroups(share: bool) -> Option<ContainerInfo> {
    Some(ContainerInfo {
        linux_info: Some(LinuxInfo {
            share_cgroups: Some(share),
        }),
    })
}

fn read(mount: &Path, path: &str) -> String {
    fs::read_to_string(mount.join(path)).unwrap()
}

/// Scenario: prepare, isolate, and clean up a single container.
#[tokio::test]
async fn test_prepare_isolate_cleanup_single_container() {
    let tmp = tempdir().unwrap();
    bootstrap(tmp.path());
    let isolator = isolator(tmp.path(), "cgroups/cpu,cgroups/memory");

    let c1 = id("c1");
    let config = ContainerConfig {
        resources: Resources {
            cpus: Some(1.0),
            mem: Some(512 * 1024 * 1024),
            ..Default::default()
        },
        ..Default::default()
    };

    let launch_info = isolator.prepare(&c1, &config).await.unwrap();
    assert!(launch_info.is_none(), "no rootfs, no launch directives");

    // Both the non-leaf and the leaf exist.
    assert!(tmp.path().join("containers/c1").is_dir());
    assert!(tmp.path().join("containers/c1/leaf").is_dir());

    // The initial update applied the requests.
    assert_eq!(read(tmp.path(), "containers/c1/cpu.max"), "100000 100000");
    assert_eq!(read(tmp.path(), "containers/c1/memory.max"), "536870912");

    // Controllers are enabled in the non-leaf but never in the leaf.
    let non_leaf_control = read(tmp.path(), "containers/c1/cgroup.subtree_control");
    assert!(non_leaf_control.contains("cpu"));
    assert!(non_leaf_control.contains("memory"));
    assert_eq!(read(tmp.path(), "containers/c1/leaf/cgroup.subtree_control"), "");

    // No process ever lives in the non-leaf.
    assert_eq!(read(tmp.path(), "containers/c1/cgroup.procs"), "");

    // The launcher places the pid into the leaf; isolate is a fan-out of
    // controller no-ops on top of that.
    fs::write(tmp.path().join("containers/c1/leaf/cgroup.procs"), "1234\n").unwrap();
    isolator.isolate(&c1, 1234).await.unwrap();
    assert_eq!(read(tmp.path(), "containers/c1/leaf/cgroup.procs"), "1234\n");

    // The container exits (the kernel empties cgroup.procs), then cleanup
    // destroys the subtree and forgets the container.
    fs::write(tmp.path().join("containers/c1/leaf/cgroup.procs"), "").unwrap();
    isolator.cleanup(&c1).await.unwrap();
    assert!(!tmp.path().join("containers/c1").exists());
    assert!(matches!(
        isolator.usage(&c1).await.unwrap_err(),
        IsolatorError::UnknownContainer(_)
    ));

    // Cleaning up again is silently ignored.
    isolator.cleanup(&c1).await.unwrap();
}

/// Scenario: a nested container sharing its parent's cgroups gets no
/// cgroups of its own and resolves through the parent chain.
#[tokio::test]
async fn test_shared_nested_container() {
    let tmp = tempdir().unwrap();
    bootstrap(tmp.path());
    let isolator = isolator(tmp.path(), "cgroups/cpu,cgroups/memory");

    let p1 = id("p1");
    isolator.prepare(&p1, &ContainerConfig::default()).await.unwrap();

    let c1 = nested(&p1, "c1");
    let config = ContainerConfig {
        container_info: share_cgroups(true),
        ..Default::default()
    };
    let launch_info = isolator.prepare(&c1, &config).await.unwrap();
    assert!(launch_info.is_none());

    // Only p1's cgroup exists.
    assert!(tmp.path().join("containers/p1").is_dir());
    assert!(!tmp.path().join("containers/p1/c1").exists());

    // Resource operations walk up to the owning ancestor.
    assert!(matches!(
        isolator
            .update(&c1, &Resources::default(), &Limits::default())
            .await
            .unwrap_err(),
        IsolatorError::UpdateNotSupported
    ));
    isolator.isolate(&c1, 4321).await.unwrap();

    let parent_status = isolator.status(&p1).await.unwrap();
    let child_status = isolator.status(&c1).await.unwrap();
    assert_eq!(parent_status.cgroup.as_deref(), Some("containers/p1"));
    assert_eq!(child_status.cgroup, parent_status.cgroup);

    isolator.usage(&c1).await.unwrap();
}

/// Scenario: an isolated nested container nests its cgroups under the
/// parent's non-leaf.
#[tokio::test]
async fn test_isolated_nested_container() {
    let tmp = tempdir().unwrap();
    bootstrap(tmp.path());
    let isolator = isolator(tmp.path(), "cgroups/cpu,cgroups/memory");

    let p1 = id("p1");
    isolator.prepare(&p1, &ContainerConfig::default()).await.unwrap();

    let c1 = nested(&p1, "c1");
    let config = ContainerConfig {
        container_info: share_cgroups(false),
        ..Default::default()
    };
    isolator.prepare(&c1, &config).await.unwrap();

    assert!(tmp.path().join("containers/p1/c1/leaf").is_dir());

    // Every hop from below the root down to the nested non-leaf has the
    // controllers enabled.
    for cgroup in ["containers/p1", "containers/p1/c1"] {
        let control = read(tmp.path(), &format!("{cgroup}/cgroup.subtree_control"));
        assert!(control.contains("cpu"), "{cgroup}: {control}");
        assert!(control.contains("memory"), "{cgroup}: {control}");
    }

    // The nested container has its own info and supports update.
    isolator
        .update(&c1, &Resources::default(), &Limits::default())
        .await
        .unwrap();
}

/// Two updates with the same requests and limits leave identical control
/// files behind.
#[tokio::test]
async fn test_update_is_idempotent() {
    let tmp = tempdir().unwrap();
    bootstrap(tmp.path());
    let isolator = isolator(tmp.path(), "cgroups/cpu,cgroups/memory,cgroups/pids");

    let c1 = id("c1");
    isolator.prepare(&c1, &ContainerConfig::default()).await.unwrap();

    let requests = Resources {
        cpus: Some(0.5),
        mem: Some(256 * 1024 * 1024),
        pids: Some(128),
        ..Default::default()
    };
    let limits = Limits {
        cpus: Some(2.0),
        mem: Some(512 * 1024 * 1024),
    };

    let controls = [
        "containers/c1/cpu.weight",
        "containers/c1/cpu.max",
        "containers/c1/memory.low",
        "containers/c1/memory.max",
        "containers/c1/pids.max",
    ];

    isolator.update(&c1, &requests, &limits).await.unwrap();
    let first: Vec<String> = controls.iter().map(|c| read(tmp.path(), c)).collect();

    isolator.update(&c1, &requests, &limits).await.unwrap();
    let second: Vec<String> = controls.iter().map(|c| read(tmp.path(), c)).collect();

    assert_eq!(first, second);
    assert_eq!(read(tmp.path(), "containers/c1/cpu.max"), "200000 100000");
    assert_eq!(read(tmp.path(), "containers/c1/memory.low"), "268435456");
}

/// Preparing the same container twice fails, as does preparing over a
/// leftover cgroup.
#[tokio::test]
async fn test_prepare_twice_fails() {
    let tmp = tempdir().unwrap();
    bootstrap(tmp.path());
    let isolator = isolator(tmp.path(), "cgroups/cpu");

    let c1 = id("c1");
    isolator.prepare(&c1, &ContainerConfig::default()).await.unwrap();
    assert!(matches!(
        isolator
            .prepare(&c1, &ContainerConfig::default())
            .await
            .unwrap_err(),
        IsolatorError::AlreadyPrepared(_)
    ));
}

/// Scenario: an unknown orphan discovered by the sweep is recovered and
/// then destroyed during recovery.
#[tokio::test]
async fn test_recovery_destroys_unknown_orphan() {
    let tmp = tempdir().unwrap();
    bootstrap(tmp.path());

    // Leftovers of a container the previous agent incarnation launched.
    fs::create_dir_all(tmp.path().join("containers/ghost/leaf")).unwrap();
    fs::write(
        tmp.path().join("containers/ghost/cgroup.subtree_control"),
        "+cpu +memory",
    )
    .unwrap();

    let isolator = isolator(tmp.path(), "cgroups/cpu,cgroups/memory");
    isolator.recover(&[], &HashSet::new()).await.unwrap();

    assert!(!tmp.path().join("containers/ghost").exists());
    assert!(matches!(
        isolator.usage(&id("ghost")).await.unwrap_err(),
        IsolatorError::UnknownContainer(_)
    ));
}

/// Known orphans are recovered but left for the agent's own cleanup path,
/// and recovery is idempotent.
#[tokio::test]
async fn test_recovery_keeps_known_orphan() {
    let tmp = tempdir().unwrap();
    bootstrap(tmp.path());

    fs::create_dir_all(tmp.path().join("containers/ghost/leaf")).unwrap();
    fs::write(
        tmp.path().join("containers/ghost/cgroup.subtree_control"),
        "+cpu +memory",
    )
    .unwrap();

    let isolator = isolator(tmp.path(), "cgroups/cpu,cgroups/memory");
    let ghost = id("ghost");
    let orphans: HashSet<ContainerId> = [ghost.clone()].into_iter().collect();

    isolator.recover(&[], &orphans).await.unwrap();
    assert!(tmp.path().join("containers/ghost").is_dir());
    isolator.usage(&ghost).await.unwrap();

    // A second recovery changes nothing.
    isolator.recover(&[], &orphans).await.unwrap();
    assert!(tmp.path().join("containers/ghost").is_dir());
    isolator.usage(&ghost).await.unwrap();

    // The agent retires it through the normal path.
    isolator.cleanup(&ghost).await.unwrap();
    assert!(!tmp.path().join("containers/ghost").exists());
}

/// Checkpointed containers are recovered from their on-disk cgroups;
/// missing directories are repaired so the uniform destroy path applies.
#[tokio::test]
async fn test_recovery_of_checkpointed_containers() {
    let tmp = tempdir().unwrap();
    bootstrap(tmp.path());
    let isolator = isolator(tmp.path(), "cgroups/cpu,cgroups/memory");

    let p1 = id("p1");
    let shared = nested(&p1, "c1");
    let states = [
        ContainerState {
            container_id: p1.clone(),
            container_info: None,
        },
        ContainerState {
            container_id: shared.clone(),
            container_info: share_cgroups(true),
        },
    ];

    isolator.recover(&states, &HashSet::new()).await.unwrap();

    // p1 was repaired on disk; the shared nested container stays virtual.
    assert!(tmp.path().join("containers/p1/leaf").is_dir());
    assert!(!tmp.path().join("containers/p1/c1").exists());
    assert!(matches!(
        isolator
            .update(&shared, &Resources::default(), &Limits::default())
            .await
            .unwrap_err(),
        IsolatorError::UpdateNotSupported
    ));
}

struct FailingMemoryController;

#[async_trait::async_trait]
impl Controller for FailingMemoryController {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn prepare(
        &self,
        _container_id: &ContainerId,
        _cgroup: &str,
        _config: &ContainerConfig,
    ) -> cgroups2_isolator::Result<()> {
        Err(IsolatorError::Filesystem("injected prepare failure".to_string()))
    }
}

/// Scenario: one controller failing to prepare fails the whole prepare
/// with a controller-tagged message; the cgroups stay behind for cleanup.
#[tokio::test]
async fn test_partial_controller_failure_on_prepare() {
    let tmp = tempdir().unwrap();
    bootstrap(tmp.path());

    let fs_facade = Arc::new(CgroupFs::with_mount(tmp.path()));
    let mut controllers: HashMap<String, Arc<dyn Controller>> =
        cgroups2_isolator::controllers::create_controllers(
            &flags("cgroups/cpu"),
            Arc::clone(&fs_facade),
            Arc::new(NoopDeviceManager),
        )
        .unwrap();
    controllers.insert("memory".to_string(), Arc::new(FailingMemoryController));

    let isolator = Cgroups2Isolator::with_controllers(
        flags("cgroups/cpu"),
        fs_facade,
        controllers,
        Arc::new(NoopDeviceManager),
    );

    let c1 = id("c1");
    let err = isolator
        .prepare(&c1, &ContainerConfig::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("memory:"), "{err}");

    // The half-prepared cgroups remain until a later cleanup.
    assert!(tmp.path().join("containers/c1/leaf").is_dir());
    isolator.cleanup(&c1).await.unwrap();
    assert!(!tmp.path().join("containers/c1").exists());
}

/// Scenario: exactly one limitation is delivered when the kernel reports
/// an OOM kill.
#[tokio::test]
async fn test_limitation_delivery_on_oom() {
    let tmp = tempdir().unwrap();
    bootstrap(tmp.path());
    let isolator = isolator(tmp.path(), "cgroups/memory");

    let c1 = id("c1");
    isolator.prepare(&c1, &ContainerConfig::default()).await.unwrap();

    let events_file = tmp.path().join("containers/c1/memory.events");
    fs::write(&events_file, "low 0\noom 0\noom_kill 0\n").unwrap();

    let limitation_rx = isolator.watch(&c1).await.unwrap();

    // Give the memory watch time to record the initial oom_kill count,
    // then report a kill the way the kernel would.
    tokio::time::sleep(Duration::from_millis(300)).await;
    fs::write(&events_file, "low 0\noom 1\noom_kill 1\n").unwrap();

    let limitation = timeout(Duration::from_secs(5), limitation_rx)
        .await
        .expect("limitation not delivered in time")
        .unwrap();
    assert_eq!(limitation.controller, "memory");
    assert_eq!(limitation.resource, "memory");

    // The one-shot promise is spent; a second watch is refused and a
    // second pressure event has nowhere to go.
    assert!(matches!(
        isolator.watch(&c1).await.unwrap_err(),
        IsolatorError::AlreadyWatched(_)
    ));
    fs::write(&events_file, "low 0\noom 2\noom_kill 2\n").unwrap();

    isolator.cleanup(&c1).await.unwrap();
}

/// Launch directives: a rootfs container gets new cgroup and mount
/// namespaces with its leaf bound at /sys/fs/cgroup; a command task gets
/// the directives wrapped for the executor to forward.
#[tokio::test]
async fn test_launch_info_for_rootfs_containers() {
    let tmp = tempdir().unwrap();
    bootstrap(tmp.path());
    let isolator = isolator(tmp.path(), "cgroups/cpu");

    let c1 = id("c1");
    let config = ContainerConfig {
        rootfs: Some("/var/run/rootfs-c1".into()),
        ..Default::default()
    };
    let launch_info = isolator.prepare(&c1, &config).await.unwrap().unwrap();

    assert_eq!(launch_info.clone_namespaces.len(), 2);
    assert_eq!(launch_info.mounts.len(), 1);
    let mount = &launch_info.mounts[0];
    assert_eq!(mount.source, tmp.path().join("containers/c1/leaf"));
    assert_eq!(mount.target, Path::new("/var/run/rootfs-c1/sys/fs/cgroup"));
    assert!(mount.bind && mount.recursive);

    // Command task: the executor must not see the mounts.
    let c2 = id("c2");
    let config = ContainerConfig {
        rootfs: Some("/var/run/rootfs-c2".into()),
        task_info: Some(TaskInfo { command_user: None }),
        ..Default::default()
    };
    let envelope = isolator.prepare(&c2, &config).await.unwrap().unwrap();

    assert!(envelope.clone_namespaces.is_empty());
    assert!(envelope.mounts.is_empty());
    assert_eq!(envelope.command_arguments.len(), 1);
    let argument = &envelope.command_arguments[0];
    assert!(argument.starts_with("--task_launch_info="));
    assert!(argument.contains("sys/fs/cgroup"));
}
