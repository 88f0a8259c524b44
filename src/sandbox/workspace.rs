//! Per-request workspaces.
//!
//! A [`Workspace`] is a uniquely named directory under the configured root,
//! owned by exactly one request and removed when it is dropped. The
//! [`WorkspaceManager`] also runs a reaper that removes directories left
//! behind by a crashed process.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::path_guard::{confine, ConfinedPath, SafeName};
use crate::error::{EngineError, Result};

/// Prefix of every workspace directory name.
const WORKSPACE_PREFIX: &str = "run-";

/// Fixed subdirectories created in every workspace.
pub const SUBDIRS: &[&str] = &["src", "bin", "io", "debug"];

/// Creates workspaces under a single canonical root.
#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
    retention: Duration,
    reaper_interval: Duration,
}

impl WorkspaceManager {
    /// Create the root (owner-only on Unix) and canonicalize it.
    pub fn new(root: &Path, retention: Duration, reaper_interval: Duration) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| {
            EngineError::io(format!("failed to create workspace root {}", root.display()), e)
        })?;
        restrict_permissions(root)?;
        let root = root.canonicalize().map_err(|e| {
            EngineError::io(format!("failed to resolve workspace root {}", root.display()), e)
        })?;

        Ok(Self {
            root,
            retention,
            reaper_interval,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a fresh workspace with a globally unique name.
    pub fn create(&self) -> Result<Workspace> {
        let id = Uuid::new_v4().to_string();
        let dir = confine(Path::new(&format!("{WORKSPACE_PREFIX}{id}")), &self.root)?;

        // create_dir, not create_dir_all: an existing directory is a collision.
        fs::create_dir(&dir).map_err(|e| {
            EngineError::io(format!("failed to create workspace {}", dir.as_path().display()), e)
        })?;
        let workspace = Workspace {
            id,
            dir,
            removed: false,
        };
        restrict_permissions(workspace.dir.as_path())?;
        for sub in SUBDIRS {
            let path = workspace.confine(Path::new(sub))?;
            fs::create_dir(&path).map_err(|e| {
                EngineError::io(format!("failed to create {}", path.as_path().display()), e)
            })?;
        }

        debug!(workspace = %workspace.id, "Created workspace");
        Ok(workspace)
    }

    /// Remove workspace directories older than the retention window.
    ///
    /// Live workspaces are younger than any sensible retention window, so
    /// only leftovers from a crashed process are reaped.
    pub fn cleanup_expired(&self) -> usize {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "Cannot read workspace root");
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(WORKSPACE_PREFIX) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if !meta.is_dir() || age <= self.retention {
                continue;
            }

            let Ok(path) = confine(Path::new(&name), &self.root) else {
                continue;
            };
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    info!(path = %path, age_secs = age.as_secs(), "Reaped stale workspace");
                    removed += 1;
                }
                Err(e) => warn!(path = %path, error = %e, "Failed to reap stale workspace"),
            }
        }
        removed
    }

    /// Start the background reaper task.
    ///
    /// Returns a `JoinHandle` that runs until aborted.
    pub fn start_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.reaper_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let manager = Arc::clone(&manager);
                // Directory removal blocks; keep it off the async workers.
                let removed = tokio::task::spawn_blocking(move || manager.cleanup_expired())
                    .await
                    .unwrap_or(0);
                if removed > 0 {
                    debug!(removed, "Reaper sweep");
                }
            }
        })
    }
}

/// A request-scoped directory tree. Removed by [`Workspace::close`] or on drop.
#[derive(Debug)]
pub struct Workspace {
    id: String,
    dir: ConfinedPath,
    removed: bool,
}

impl Workspace {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &ConfinedPath {
        &self.dir
    }

    /// Confine a path relative to (or absolute within) this workspace.
    pub fn confine(&self, path: &Path) -> Result<ConfinedPath> {
        confine(path, self.dir.as_path())
    }

    /// Confined path of `name` inside the fixed subdirectory `sub`.
    pub fn path_in(&self, sub: &str, name: &SafeName) -> Result<ConfinedPath> {
        self.confine(&Path::new(sub).join(name))
    }

    /// Write `contents` to `name` inside `sub`. Returns the confined path.
    pub fn write_file(&self, sub: &str, name: &SafeName, contents: &[u8]) -> Result<ConfinedPath> {
        let path = self.path_in(sub, name)?;
        fs::write(&path, contents).map_err(|e| {
            EngineError::io(format!("failed to write {}", path.as_path().display()), e)
        })?;
        Ok(path)
    }
}

impl Workspace {
    /// Remove the directory tree on the blocking pool.
    ///
    /// Falls back to removal on drop if the blocking task fails.
    pub async fn close(mut self) {
        let dir = self.dir.as_path().to_path_buf();
        match tokio::task::spawn_blocking(move || fs::remove_dir_all(dir)).await {
            Ok(result) => {
                self.removed = true;
                log_removal(&self.id, result);
            }
            Err(e) => warn!(workspace = %self.id, error = %e, "Workspace removal task failed"),
        }
    }
}

/// Blocking removal for workspaces that were never closed.
impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.removed {
            log_removal(&self.id, fs::remove_dir_all(&self.dir));
        }
    }
}

fn log_removal(id: &str, result: std::io::Result<()>) {
    match result {
        Ok(()) => debug!(workspace = %id, "Removed workspace"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(workspace = %id, error = %e, "Failed to remove workspace"),
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .map_err(|e| EngineError::io(format!("failed to restrict {}", path.display()), e))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
