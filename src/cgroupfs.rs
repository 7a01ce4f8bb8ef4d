//! cgroup v2 filesystem facade
//!
//! Thin wrapper over the unified hierarchy: mount probing, directory
//! lifecycle, control-file access, controller enablement, and the
//! freeze/kill/drain destroy sequence. Cgroups are named by paths relative
//! to the mount point, so `containers/c1` is `/sys/fs/cgroup/containers/c1`
//! under the default mount.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::sys::signal::{Signal, kill};
use nix::sys::statfs::{CGROUP2_SUPER_MAGIC, statfs};
use nix::unistd::Pid;

use crate::errors::{IsolatorError, Result};

const CGROUP2_MOUNT: &str = "/sys/fs/cgroup";

/// Facade over one cgroup2 mount point.
#[derive(Debug, Clone)]
pub struct CgroupFs {
    mount: PathBuf,
}

impl Default for CgroupFs {
    fn default() -> Self {
        Self::new()
    }
}

impl CgroupFs {
    /// Facade over the standard mount at `/sys/fs/cgroup`.
    pub fn new() -> Self {
        Self {
            mount: PathBuf::from(CGROUP2_MOUNT),
        }
    }

    /// Facade over a non-standard mount point. Tests point this at a
    /// tempdir-backed hierarchy.
    pub fn with_mount(mount: impl Into<PathBuf>) -> Self {
        Self {
            mount: mount.into(),
        }
    }

    /// Absolute path of a cgroup.
    pub fn path(&self, cgroup: &str) -> PathBuf {
        self.mount.join(cgroup.trim_matches('/'))
    }

    /// Whether the kernel advertises cgroup v2 support.
    pub fn enabled() -> bool {
        fs::read_to_string("/proc/filesystems")
            .map(|content| {
                content
                    .lines()
                    .any(|line| line.split_whitespace().any(|token| token == "cgroup2"))
            })
            .unwrap_or(false)
    }

    /// Whether the cgroup2 file system is mounted at the mount point.
    pub fn mounted(&self) -> Result<bool> {
        match statfs(&self.mount) {
            Ok(stat) => Ok(stat.filesystem_type() == CGROUP2_SUPER_MAGIC),
            Err(nix::errno::Errno::ENOENT) => Ok(false),
            Err(errno) => Err(IsolatorError::Filesystem(format!(
                "Failed to statfs '{}': {errno}",
                self.mount.display()
            ))),
        }
    }

    /// Mount the cgroup2 file system. Fails if something is already mounted
    /// at the mount point.
    pub fn mount(&self) -> Result<()> {
        if self.mounted()? {
            return Err(IsolatorError::Filesystem(format!(
                "cgroup2 is already mounted at '{}'",
                self.mount.display()
            )));
        }

        fs::create_dir_all(&self.mount).map_err(|e| {
            IsolatorError::Filesystem(format!(
                "Failed to create mount point '{}': {e}",
                self.mount.display()
            ))
        })?;

        nix::mount::mount(
            Some("cgroup2"),
            &self.mount,
            Some("cgroup2"),
            nix::mount::MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|errno| {
            IsolatorError::Filesystem(format!(
                "Failed to mount cgroup2 at '{}': {errno}",
                self.mount.display()
            ))
        })
    }

    /// Unmount the cgroup2 file system. All descendant cgroups must have
    /// been removed first; the kernel rejects a busy unmount.
    pub fn unmount(&self) -> Result<()> {
        nix::mount::umount(&self.mount).map_err(|errno| {
            IsolatorError::Filesystem(format!(
                "Failed to unmount cgroup2 from '{}': {errno}",
                self.mount.display()
            ))
        })
    }

    pub fn exists(&self, cgroup: &str) -> bool {
        self.path(cgroup).is_dir()
    }

    /// Create a cgroup, with missing ancestors when `recursive`.
    pub fn create(&self, cgroup: &str, recursive: bool) -> Result<()> {
        let components: Vec<&str> = cgroup
            .trim_matches('/')
            .split('/')
            .filter(|c| !c.is_empty())
            .collect();

        let mut current = self.mount.clone();
        for (depth, component) in components.iter().enumerate() {
            let last = depth + 1 == components.len();
            current = current.join(component);
            if current.is_dir() {
                continue;
            }
            if !last && !recursive {
                return Err(IsolatorError::Filesystem(format!(
                    "Missing parent cgroup '{}'",
                    current.display()
                )));
            }
            fs::create_dir(&current).map_err(|e| {
                IsolatorError::Filesystem(format!(
                    "Failed to create cgroup '{}': {e}",
                    current.display()
                ))
            })?;
            self.seed_control_files(&current)?;
        }
        Ok(())
    }

    // The kernel materializes the cgroup.* files when a cgroup is created;
    // on a plain filesystem (hermetic test hierarchies) they are seeded
    // here instead. Existing files are left untouched, so this is a no-op
    // on real cgroupfs.
    fn seed_control_files(&self, dir: &Path) -> Result<()> {
        let inherited = fs::read_to_string(dir.parent().unwrap_or(dir).join("cgroup.subtree_control"))
            .unwrap_or_default();

        let defaults = [
            ("cgroup.controllers", inherited.trim().to_string()),
            ("cgroup.subtree_control", String::new()),
            ("cgroup.procs", String::new()),
            ("cgroup.events", "populated 0\nfrozen 0\n".to_string()),
        ];

        for (name, content) in defaults {
            let file = dir.join(name);
            if !file.exists() {
                fs::write(&file, content).map_err(|e| {
                    IsolatorError::Filesystem(format!(
                        "Failed to create '{}': {e}",
                        file.display()
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Direct child cgroups, sorted.
    pub fn list_children(&self, cgroup: &str) -> Result<Vec<String>> {
        let abs = self.path(cgroup);
        let mut children = Vec::new();
        let entries = fs::read_dir(&abs).map_err(|e| {
            IsolatorError::Filesystem(format!("Failed to read '{}': {e}", abs.display()))
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| {
                IsolatorError::Filesystem(format!("Failed to read '{}': {e}", abs.display()))
            })?;
            if entry.path().is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                children.push(format!("{}/{}", cgroup.trim_matches('/'), name));
            }
        }
        children.sort();
        Ok(children)
    }

    /// All descendant cgroups in pre-order (parents before children), not
    /// including `cgroup` itself.
    pub fn list_descendants(&self, cgroup: &str) -> Result<Vec<String>> {
        let mut descendants = Vec::new();
        let mut stack = self.list_children(cgroup)?;
        stack.reverse();
        while let Some(current) = stack.pop() {
            let mut children = self.list_children(&current)?;
            children.reverse();
            descendants.push(current);
            stack.extend(children);
        }
        Ok(descendants)
    }

    pub fn read_control(&self, cgroup: &str, control: &str) -> Result<String> {
        let file = self.path(cgroup).join(control);
        fs::read_to_string(&file).map_err(|e| {
            IsolatorError::Filesystem(format!("Failed to read '{}': {e}", file.display()))
        })
    }

    pub fn write_control(&self, cgroup: &str, control: &str, value: &str) -> Result<()> {
        let file = self.path(cgroup).join(control);
        fs::write(&file, value).map_err(|e| {
            IsolatorError::Filesystem(format!("Failed to write '{}': {e}", file.display()))
        })
    }

    /// Controllers the kernel offers at this cgroup (`cgroup.controllers`).
    /// A missing file reads as empty so half-created hierarchies can still
    /// be recovered and destroyed.
    pub fn available_controllers(&self, cgroup: &str) -> Result<BTreeSet<String>> {
        self.read_controller_set(cgroup, "cgroup.controllers")
    }

    /// Controllers enabled for this cgroup's children
    /// (`cgroup.subtree_control`).
    pub fn enabled_controllers(&self, cgroup: &str) -> Result<BTreeSet<String>> {
        self.read_controller_set(cgroup, "cgroup.subtree_control")
    }

    fn read_controller_set(&self, cgroup: &str, control: &str) -> Result<BTreeSet<String>> {
        let file = self.path(cgroup).join(control);
        match fs::read_to_string(&file) {
            Ok(content) => Ok(content
                .split_whitespace()
                .map(|token| token.trim_start_matches('+').to_string())
                .collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeSet::new()),
            Err(e) => Err(IsolatorError::Filesystem(format!(
                "Failed to read '{}': {e}",
                file.display()
            ))),
        }
    }

    /// Enable controllers for the children of `cgroup` by writing `+name`
    /// tokens into `cgroup.subtree_control`. Idempotent; fails with
    /// `InvalidController` for names not offered at this cgroup.
    pub fn enable_controllers(&self, cgroup: &str, names: &[&str]) -> Result<()> {
        let available = self.available_controllers(cgroup)?;
        let mut enabled = self.enabled_controllers(cgroup)?;

        for name in names {
            if !available.contains(*name) {
                return Err(IsolatorError::InvalidController {
                    name: name.to_string(),
                    reason: format!("not available in cgroup '{cgroup}'"),
                });
            }
            enabled.insert(name.to_string());
        }

        let tokens: Vec<String> = enabled.iter().map(|name| format!("+{name}")).collect();
        self.write_control(cgroup, "cgroup.subtree_control", &tokens.join(" "))
    }

    /// Pids currently attached to the cgroup (`cgroup.procs`). A missing
    /// file reads as empty.
    pub fn procs(&self, cgroup: &str) -> Result<Vec<i32>> {
        let file = self.path(cgroup).join("cgroup.procs");
        let content = match fs::read_to_string(&file) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(IsolatorError::Filesystem(format!(
                    "Failed to read '{}': {e}",
                    file.display()
                )));
            }
        };
        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .collect())
    }

    pub fn freeze(&self, cgroup: &str) -> Result<()> {
        self.write_control(cgroup, "cgroup.freeze", "1")
    }

    pub fn thaw(&self, cgroup: &str) -> Result<()> {
        self.write_control(cgroup, "cgroup.freeze", "0")
    }

    /// Change ownership of the cgroup directory itself (non-recursive, so
    /// the control files stay owned by the agent user).
    pub fn chown(&self, cgroup: &str, user: &str) -> Result<()> {
        let record = nix::unistd::User::from_name(user)
            .map_err(|errno| {
                IsolatorError::Filesystem(format!("Failed to look up user '{user}': {errno}"))
            })?
            .ok_or_else(|| IsolatorError::Filesystem(format!("User '{user}' not found")))?;

        let abs = self.path(cgroup);
        nix::unistd::chown(&abs, Some(record.uid), Some(record.gid)).map_err(|errno| {
            IsolatorError::Filesystem(format!(
                "Failed to chown '{}' to '{user}': {errno}",
                abs.display()
            ))
        })
    }

    /// Destroy a cgroup subtree: freeze it, SIGKILL every attached pid,
    /// wait with bounded backoff until `cgroup.procs` drains everywhere,
    /// then remove the directories bottom-up. Fails with `DestroyFailed`
    /// when processes remain after the timeout.
    pub async fn destroy(&self, cgroup: &str, timeout: Duration) -> Result<()> {
        if !self.exists(cgroup) {
            return Ok(());
        }

        if let Err(e) = self.freeze(cgroup) {
            debug!("Failed to freeze cgroup '{cgroup}' before destroy: {e}");
        }

        let deadline = Instant::now() + timeout;
        let mut delay = Duration::from_millis(100);
        loop {
            let remaining = self.kill_all(cgroup)?;
            if remaining == 0 {
                break;
            }
            if Instant::now() >= deadline {
                return Err(IsolatorError::DestroyFailed {
                    cgroup: cgroup.to_string(),
                    reason: format!("{remaining} processes remain after {timeout:?}"),
                });
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(1));
        }

        let descendants = self.list_descendants(cgroup)?;
        for descendant in descendants.iter().rev() {
            self.remove_cgroup_dir(&self.path(descendant))?;
        }
        self.remove_cgroup_dir(&self.path(cgroup))
    }

    // SIGKILL every pid in the subtree; returns how many pids were still
    // attached. ESRCH means the process exited between read and kill.
    fn kill_all(&self, cgroup: &str) -> Result<usize> {
        let mut cgroups = vec![cgroup.to_string()];
        cgroups.extend(self.list_descendants(cgroup)?);

        let mut remaining = 0;
        for current in &cgroups {
            for pid in self.procs(current)? {
                remaining += 1;
                match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                    Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                    Err(errno) => {
                        warn!("Failed to kill pid {pid} in cgroup '{current}': {errno}");
                    }
                }
            }
        }
        Ok(remaining)
    }

    fn remove_cgroup_dir(&self, abs: &Path) -> Result<()> {
        match fs::remove_dir(abs) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => {
                // cgroupfs removes a cgroup while its control files remain,
                // so ENOTEMPTY there can only mean child cgroups. On a plain
                // filesystem the seeded control files must be unlinked
                // first; child directories are never touched.
                let has_subdirs = fs::read_dir(abs)
                    .map_err(|e| {
                        IsolatorError::Filesystem(format!(
                            "Failed to read '{}': {e}",
                            abs.display()
                        ))
                    })?
                    .filter_map(|entry| entry.ok())
                    .any(|entry| entry.path().is_dir());
                if has_subdirs {
                    return Err(IsolatorError::Filesystem(format!(
                        "Failed to remove '{}': child cgroups remain",
                        abs.display()
                    )));
                }
                for entry in fs::read_dir(abs).into_iter().flatten().flatten() {
                    if entry.path().is_file() {
                        let _ = fs::remove_file(entry.path());
                    }
                }
                fs::remove_dir(abs).map_err(|e| {
                    IsolatorError::Filesystem(format!(
                        "Failed to remove '{}': {e}",
                        abs.display()
                    ))
                })
            }
            Err(e) => Err(IsolatorError::Filesystem(format!(
                "Failed to remove '{}': {e}",
                abs.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fixture() -> (tempfile::TempDir, CgroupFs) {
        let tmp = tempdir().unwrap();
        let fs = CgroupFs::with_mount(tmp.path());
        std::fs::write(tmp.path().join("cgroup.subtree_control"), "cpu memory pids").unwrap();
        (tmp, fs)
    }

    #[test]
    fn test_create_seeds_control_files() {
        let (tmp, fs) = fixture();
        fs.create("containers/c1", true).unwrap();

        assert!(tmp.path().join("containers/c1/cgroup.procs").exists());
        // The root inherits its available controllers from the mount's
        // subtree control; the child starts with the root's empty one.
        let expected: BTreeSet<String> =
            ["cpu", "memory", "pids"].iter().map(|s| s.to_string()).collect();
        assert_eq!(fs.available_controllers("containers").unwrap(), expected);
        assert!(fs.available_controllers("containers/c1").unwrap().is_empty());
    }

    #[test]
    fn test_create_non_recursive_requires_parent() {
        let (_tmp, fs) = fixture();
        assert!(fs.create("missing/child", false).is_err());
        assert!(fs.create("missing/child", true).is_ok());
    }

    #[test]
    fn test_enable_controllers_is_idempotent() {
        let (_tmp, fs) = fixture();
        fs.create("containers", false).unwrap();

        fs.enable_controllers("containers", &["cpu"]).unwrap();
        fs.enable_controllers("containers", &["cpu", "memory"]).unwrap();

        let enabled = fs.enabled_controllers("containers").unwrap();
        assert!(enabled.contains("cpu"));
        assert!(enabled.contains("memory"));

        let raw = fs.read_control("containers", "cgroup.subtree_control").unwrap();
        assert_eq!(raw, "+cpu +memory");
    }

    #[test]
    fn test_enable_unavailable_controller_fails() {
        let (_tmp, fs) = fixture();
        fs.create("containers", false).unwrap();

        let err = fs.enable_controllers("containers", &["hugetlb"]).unwrap_err();
        assert!(matches!(err, IsolatorError::InvalidController { .. }));
    }

    #[test]
    fn test_list_descendants_preorder() {
        let (_tmp, fs) = fixture();
        fs.create("containers/p1/c1/leaf", true).unwrap();
        fs.create("containers/p1/leaf", true).unwrap();

        let descendants = fs.list_descendants("containers").unwrap();
        assert_eq!(
            descendants,
            vec![
                "containers/p1".to_string(),
                "containers/p1/c1".to_string(),
                "containers/p1/c1/leaf".to_string(),
                "containers/p1/leaf".to_string(),
            ]
        );
    }

    #[test]
    fn test_procs_parses_pids() {
        let (_tmp, fs) = fixture();
        fs.create("containers/c1", true).unwrap();
        fs.write_control("containers/c1", "cgroup.procs", "101\n202\n").unwrap();
        assert_eq!(fs.procs("containers/c1").unwrap(), vec![101, 202]);
        assert!(fs.procs("containers/ghost").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_removes_subtree() {
        let (tmp, fs) = fixture();
        fs.create("containers/c1/leaf", true).unwrap();
        fs.write_control("containers/c1", "cpu.max", "max 100000").unwrap();

        fs.destroy("containers/c1", Duration::from_secs(1)).await.unwrap();
        assert!(!tmp.path().join("containers/c1").exists());
        assert!(tmp.path().join("containers").exists());
    }

    #[tokio::test]
    async fn test_destroy_missing_cgroup_is_ok() {
        let (_tmp, fs) = fixture();
        fs.destroy("containers/ghost", Duration::from_secs(1)).await.unwrap();
    }
}
