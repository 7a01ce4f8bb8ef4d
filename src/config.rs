//! Agent configuration consumed by the isolator

use std::collections::BTreeSet;
use std::time::Duration;

use crate::errors::{IsolatorError, Result};

/// Controller names this isolator knows how to drive.
pub const CONTROLLERS: &[&str] = &[
    "core",
    "cpu",
    "memory",
    "io",
    "pids",
    "cpuset",
    "hugetlb",
    "perf_event",
    "devices",
];

/// Flags consumed by the isolator. The agent parses these from its command
/// line; `isolator-ctl` does the same with clap.
#[derive(Debug, Clone)]
pub struct Flags {
    /// Root cgroup of the agent, relative to the cgroup2 mount point. Must
    /// exist before the engine accepts any `prepare`; the agent bootstrap
    /// establishes it together with its subtree control.
    pub cgroups_root: String,

    /// Comma-separated isolation tokens. Tokens of the form
    /// `cgroups/<controller>` select controllers; `cgroups/all` selects
    /// everything. Tokens without the `cgroups/` prefix belong to other
    /// isolators and are ignored here.
    pub isolation: String,

    /// Whether containers run as the user in their config; gates the chown
    /// of the leaf cgroup.
    pub switch_user: bool,

    /// Kill-and-drain timeout for destroying one container's cgroup
    /// subtree.
    pub destroy_timeout: Duration,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            cgroups_root: "containers".to_string(),
            isolation: "cgroups/cpu,cgroups/memory".to_string(),
            switch_user: true,
            destroy_timeout: Duration::from_secs(60),
        }
    }
}

impl Flags {
    /// Resolve the isolation tokens into the set of controller names to
    /// register. The synthetic `core` controller is always included because
    /// the `cgroup.*` files it drives exist in every cgroup.
    pub fn controller_names(&self) -> Result<BTreeSet<String>> {
        let mut names: BTreeSet<String> = BTreeSet::new();
        names.insert("core".to_string());

        for token in self.isolation.split(',') {
            let token = token.trim();
            let Some(name) = token.strip_prefix("cgroups/") else {
                // Not a cgroups isolation token; another isolator's concern.
                continue;
            };

            if name == "all" {
                names.extend(CONTROLLERS.iter().map(|name| name.to_string()));
                continue;
            }

            if !CONTROLLERS.contains(&name) {
                return Err(IsolatorError::InvalidConfig(format!(
                    "Unknown or unsupported isolator 'cgroups/{name}'"
                )));
            }

            names.insert(name.to_string());
        }

        Ok(names)
    }
}
