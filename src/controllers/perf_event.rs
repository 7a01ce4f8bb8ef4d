//! `perf_event` controller
//!
//! Membership only: attaching a cgroup to perf sampling happens entirely in
//! the kernel once the cgroup exists, and the controller never appears in
//! `cgroup.controllers`, so there are no control files to drive.

use async_trait::async_trait;

use super::Controller;

pub struct PerfEventController;

impl PerfEventController {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PerfEventController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Controller for PerfEventController {
    fn name(&self) -> &'static str {
        "perf_event"
    }
}
