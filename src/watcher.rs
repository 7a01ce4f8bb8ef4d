//! Control-file watcher
//!
//! Controllers observe kernel event files (`memory.events`, `pids.events`)
//! through this watcher. Each registered file is polled on an interval and
//! subscribers receive an event whenever its content changes or the file
//! disappears. The per-file tasks unregister themselves once the file is
//! gone or the subscriber hangs up, so a destroyed cgroup leaves nothing
//! behind.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::{IsolatorError, Result};

/// Default poll interval for event files.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// File content changed; more changes may follow.
    Modified,
    /// File disappeared; the watch has been removed.
    Removed,
}

/// Watches a set of files for content changes.
pub struct Watcher {
    interval: Duration,
    // Small map, touched only on add/remove and task exit.
    watches: Arc<Mutex<HashMap<PathBuf, JoinHandle<()>>>>,
}

impl Watcher {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            watches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a file for event monitoring and return its event stream.
    ///
    /// Fails if the path does not exist or is already watched. Callers must
    /// read the file themselves after `add` returns; changes between an
    /// earlier read and the registration would otherwise be missed.
    pub fn add(&self, path: &Path) -> Result<mpsc::UnboundedReceiver<Event>> {
        if !path.is_file() {
            return Err(IsolatorError::Filesystem(format!(
                "Cannot watch '{}': not a file",
                path.display()
            )));
        }

        let mut watches = self.watches.lock().expect("watcher lock poisoned");
        if watches.contains_key(path) {
            return Err(IsolatorError::Filesystem(format!(
                "'{}' is already watched",
                path.display()
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(poll_file(
            path.to_path_buf(),
            self.interval,
            tx,
            Arc::clone(&self.watches),
        ));
        watches.insert(path.to_path_buf(), handle);
        Ok(rx)
    }

    /// Stop watching a file. Removing an unwatched file is a no-op.
    pub fn remove(&self, path: &Path) {
        let mut watches = self.watches.lock().expect("watcher lock poisoned");
        if let Some(handle) = watches.remove(path) {
            handle.abort();
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        let watches = self.watches.lock().expect("watcher lock poisoned");
        for handle in watches.values() {
            handle.abort();
        }
    }
}

async fn poll_file(
    path: PathBuf,
    interval: Duration,
    tx: mpsc::UnboundedSender<Event>,
    watches: Arc<Mutex<HashMap<PathBuf, JoinHandle<()>>>>,
) {
    let mut last = fs::read_to_string(&path).ok();

    loop {
        tokio::time::sleep(interval).await;

        let event = match fs::read_to_string(&path) {
            Ok(content) => {
                if last.as_deref() == Some(content.as_str()) {
                    continue;
                }
                last = Some(content);
                Event::Modified
            }
            Err(_) => Event::Removed,
        };

        let removed = event == Event::Removed;
        let hangup = tx.send(event).is_err();
        if removed || hangup {
            break;
        }
    }

    watches
        .lock()
        .expect("watcher lock poisoned")
        .remove(&path);
}
