//! Durable session-state snapshots so a killed process can resume.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::protocol::GameStateSnapshot;

pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);

/// Snapshots older than this are not worth resuming from; the gate is
/// applied by the caller at load time.
pub const MAX_SNAPSHOT_AGE: Duration = Duration::from_secs(60 * 60);

/// Saves and restores one `GameStateSnapshot` at a fixed path. Writes go
/// through a sibling temp file and a rename, so a reader never sees a
/// half-written snapshot.
pub struct SnapshotManager {
    path: PathBuf,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timer: Mutex::new(None),
        }
    }

    pub fn save_snapshot(&self, snapshot: &GameStateSnapshot) -> Result<()> {
        write_snapshot(&self.path, snapshot)
    }

    /// The stored snapshot, or `None` when the file is missing or corrupt.
    /// A bad snapshot is just "no snapshot" — never an error.
    pub fn load_snapshot(&self) -> Option<GameStateSnapshot> {
        fs::read(&self.path)
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
    }

    pub fn clear_snapshot(&self) {
        let _ = fs::remove_file(&self.path);
    }

    /// Persists whatever `state_provider` yields on a fixed cadence,
    /// skipping ticks where it yields nothing. Restarts the timer when one
    /// is already running.
    pub fn start_periodic_snapshots<F>(&self, interval: Duration, state_provider: F)
    where
        F: Fn() -> Option<GameStateSnapshot> + Send + 'static,
    {
        self.stop_periodic_snapshots();
        let path = self.path.clone();
        *self.timer.lock() = Some(tokio::spawn(async move {
            loop {
                sleep(interval).await;
                if let Some(snapshot) = state_provider() {
                    if let Err(e) = write_snapshot(&path, &snapshot) {
                        tracing::warn!("periodic snapshot failed: {e:#}");
                    }
                }
            }
        }));
    }

    /// Idempotent.
    pub fn stop_periodic_snapshots(&self) {
        if let Some(task) = self.timer.lock().take() {
            task.abort();
        }
    }
}

fn write_snapshot(path: &Path, snapshot: &GameStateSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("failed to create snapshot directory")?;
    }
    let payload = serde_json::to_vec(snapshot).context("failed to serialize snapshot")?;
    let tmp = tmp_path(path);
    fs::write(&tmp, payload).context("failed to write snapshot temp file")?;
    fs::rename(&tmp, path).context("failed to move snapshot into place")?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
