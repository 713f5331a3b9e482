//! Shadow copies of module libraries.
//!
//! A loaded library file cannot be replaced on Windows, and overwriting one
//! in place corrupts the running image elsewhere. When shadow copying is on,
//! the loader copies `<name>.<ext>` to a UUID-named file and loads the copy,
//! so a new build can be dropped into the programs directory while the old
//! one is still running:
//!
//! ```text
//! Programs/Foo/Foo.dll ──copy──► shadow/Foo-<uuid>.dll ──load──► domain
//!                                        ▲
//!                    deleted when the domain's last lease drops
//! ```

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use uuid::Uuid;

/// Manages the shadow directory.
#[derive(Debug)]
pub struct ShadowCopies {
    dir: PathBuf,
    enabled: bool,
    /// Copies currently backing a loaded library.
    active: Mutex<HashSet<PathBuf>>,
    /// Minimum age before an inactive leftover copy is deleted.
    max_age: Duration,
}

/// One active copy; releasing it deletes the file.
#[derive(Debug)]
pub struct ShadowCopy {
    owner: Arc<ShadowCopies>,
    path: PathBuf,
}

impl ShadowCopy {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Forget the copy and try to delete it. Must run after the library is closed.
    pub fn release(self) {
        self.owner.active.lock().remove(&self.path);
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed shadow copy {}", self.path.display()),
            Err(e) => tracing::debug!(
                "Shadow copy {} left for later cleanup: {}",
                self.path.display(),
                e
            ),
        }
    }
}

impl ShadowCopies {
    pub fn new(dir: PathBuf, enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            dir,
            enabled,
            active: Mutex::new(HashSet::new()),
            max_age: Duration::from_secs(3600),
        })
    }

    pub fn with_max_age(dir: PathBuf, enabled: bool, max_age: Duration) -> Arc<Self> {
        Arc::new(Self {
            dir,
            enabled,
            active: Mutex::new(HashSet::new()),
            max_age,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Path to hand to the platform loader.
    ///
    /// Returns a fresh copy when enabled, otherwise `None` and the caller
    /// loads the original.
    pub fn prepare(self: &Arc<Self>, module_path: &Path) -> io::Result<Option<ShadowCopy>> {
        if !self.enabled {
            return Ok(None);
        }

        fs::create_dir_all(&self.dir)?;

        let stem = module_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("module");
        let extension = module_path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or(std::env::consts::DLL_EXTENSION);
        let path = self
            .dir
            .join(format!("{}-{}.{}", stem, Uuid::new_v4(), extension));

        fs::copy(module_path, &path)?;
        self.active.lock().insert(path.clone());

        tracing::debug!(
            "Created shadow copy: {} -> {}",
            module_path.display(),
            path.display()
        );

        Ok(Some(ShadowCopy {
            owner: Arc::clone(self),
            path,
        }))
    }

    pub fn is_active(&self, path: &Path) -> bool {
        self.active.lock().contains(path)
    }

    /// Delete inactive copies older than the maximum age.
    ///
    /// Copies left behind by a crash or by a library the platform refused to
    /// release are picked up here. Returns the number of files removed.
    pub fn cleanup_stale(&self) -> io::Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }

        let cutoff = SystemTime::now()
            .checked_sub(self.max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let active = self.active.lock().clone();
        let mut removed = 0;

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if active.contains(&path) {
                continue;
            }

            let stale = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(|modified| modified <= cutoff)
                .unwrap_or(false);

            if stale && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!("Cleaned up {} stale shadow copies", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_disabled_loads_original() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let copies = ShadowCopies::new(temp.path().join("shadow"), false);

        let module = temp.path().join("Foo.so");
        fs::write(&module, b"not a library").unwrap();

        assert!(copies.prepare(&module).unwrap().is_none());
        assert!(!copies.dir().exists());
    }

    #[test]
    fn test_copy_lifecycle() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let copies = ShadowCopies::new(temp.path().join("shadow"), true);

        let module = temp.path().join("Foo.so");
        fs::write(&module, b"not a library").unwrap();

        let copy = copies.prepare(&module).unwrap().expect("copy created");
        let path = copy.path().to_path_buf();
        assert_ne!(path, module);
        assert!(path.exists());
        assert!(copies.is_active(&path));
        assert!(
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("Foo-") && n.ends_with(".so"))
        );

        copy.release();
        assert!(!path.exists());
        assert!(!copies.is_active(&path));
    }

    #[test]
    fn test_cleanup_skips_active() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let copies = ShadowCopies::with_max_age(temp.path().join("shadow"), true, Duration::ZERO);

        let module = temp.path().join("Foo.so");
        fs::write(&module, b"x").unwrap();
        let copy = copies.prepare(&module).unwrap().expect("copy created");

        let leftover = copies.dir().join("Old-1234.so");
        fs::write(&leftover, b"old").unwrap();

        assert_eq!(copies.cleanup_stale().unwrap(), 1);
        assert!(!leftover.exists());
        assert!(copy.path().exists());
        copy.release();
    }
}
