//! Polling watcher for the shared state files.
//!
//! Each tick takes a metadata snapshot of every watched path and diffs it
//! against the previous one. Creation, deletion and any change of size or
//! modification time surface as `state_file_changed`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::comms::{Event, EventBus};
use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

type Snapshot = HashMap<PathBuf, Option<FileStamp>>;

pub struct StateWatcher {
    paths: Vec<PathBuf>,
    interval: Duration,
    events: EventBus,
}

impl StateWatcher {
    pub fn new(paths: Vec<PathBuf>, interval: Duration, events: EventBus) -> Self {
        Self {
            paths,
            interval,
            events,
        }
    }

    pub fn from_config(config: &Config, events: EventBus) -> Self {
        Self::new(
            config.watched_files(),
            Duration::from_millis(config.state_watch_interval_ms.max(10)),
            events,
        )
    }

    /// Poll until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(files = self.paths.len(), interval = ?self.interval, "Watching state files");
        let mut previous = self.snapshot().await;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let current = self.snapshot().await;
            for path in changed_paths(&previous, &current) {
                debug!(path = %path.display(), "State file changed");
                self.events.publish(Event::StateFileChanged { path });
            }
            previous = current;
        }
        debug!("State watcher stopped");
    }

    async fn snapshot(&self) -> Snapshot {
        let mut snapshot = HashMap::with_capacity(self.paths.len());
        for path in &self.paths {
            let stamp = tokio::fs::metadata(path).await.ok().map(|meta| FileStamp {
                len: meta.len(),
                modified: meta.modified().ok(),
            });
            snapshot.insert(path.clone(), stamp);
        }
        snapshot
    }
}

fn changed_paths(previous: &Snapshot, current: &Snapshot) -> Vec<PathBuf> {
    let mut changed: Vec<PathBuf> = current
        .iter()
        .filter(|(path, stamp)| previous.get(*path) != Some(*stamp))
        .map(|(path, _)| path.clone())
        .collect();
    changed.sort();
    changed
}
