//! Guaranteed removal of temporary paths
//!
//! Two mechanisms cooperate:
//! - [`ScopedPath`] removes one path when the unit of work owning it ends,
//!   on every exit path (return, `?`, panic unwind, task cancellation).
//! - [`ExitCleanupRegistry`] is a finalizer list of paths that must not
//!   survive the process. It is drained on controlled shutdown (signal
//!   handler), from a panic hook, and when the registry itself is dropped.
//!
//! A `ScopedPath` registers itself while alive, so a path is covered even if
//! the process goes down before the scope ends.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Finalizer list of paths to remove at process exit
#[derive(Debug, Default)]
pub struct ExitCleanupRegistry {
    paths: Mutex<HashSet<PathBuf>>,
}

impl ExitCleanupRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a path for removal at exit
    pub fn register(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        debug!(path = %path.display(), "Registered for exit cleanup");
        self.lock().insert(path);
    }

    /// Drop a registration whose owner already cleaned up
    pub fn unregister(&self, path: &Path) -> bool {
        self.lock().remove(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains(path)
    }

    /// Remove every registered path; returns how many were removed
    ///
    /// Idempotent: drained entries are forgotten.
    pub fn drain(&self) -> usize {
        let paths: Vec<PathBuf> = self.lock().drain().collect();
        let mut removed = 0;
        for path in paths {
            match remove_path(&path) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(path = %path.display(), "Exit cleanup failed: {}", e),
            }
        }
        if removed > 0 {
            debug!(removed, "Exit cleanup drained");
        }
        removed
    }

    /// Drain the registry when any thread panics
    ///
    /// The previous hook still runs afterwards.
    pub fn install_panic_hook(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            registry.drain();
            previous(info);
        }));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        // A poisoned set of paths is still a valid set of paths
        self.paths.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ExitCleanupRegistry {
    fn drop(&mut self) {
        self.drain();
    }
}

/// A path removed when this guard is dropped
#[derive(Debug)]
pub struct ScopedPath {
    path: PathBuf,
    registry: Option<Arc<ExitCleanupRegistry>>,
    armed: bool,
}

impl ScopedPath {
    /// Take ownership of `path`, registering it for exit cleanup meanwhile
    pub fn new(path: impl Into<PathBuf>, registry: Option<Arc<ExitCleanupRegistry>>) -> Self {
        let path = path.into();
        if let Some(registry) = &registry {
            registry.register(path.clone());
        }
        Self {
            path,
            registry,
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the path on disk; ownership passes to the caller
    pub fn disarm(mut self) -> PathBuf {
        self.armed = false;
        if let Some(registry) = &self.registry {
            registry.unregister(&self.path);
        }
        std::mem::take(&mut self.path)
    }
}

impl Drop for ScopedPath {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match remove_path(&self.path) {
            Ok(_) => debug!(path = %self.path.display(), "Scoped path removed"),
            Err(e) => warn!(path = %self.path.display(), "Failed to remove scoped path: {}", e),
        }
        if let Some(registry) = &self.registry {
            registry.unregister(&self.path);
        }
    }
}

/// Remove a file or directory tree; `Ok(false)` if it was already gone
fn remove_path(path: &Path) -> io::Result<bool> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
