//! World backup and restore.
//!
//! A directory at the backup path is the only record of a pending restore, so
//! `backup` refuses to overwrite one and `restore` consumes it.

use std::fs;
use std::path::Path;

use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::error::BenchError;

/// Filesystem operations on the benchmarked world.
pub trait WorldStore {
    /// Copy `world` into `backup`. Fails if `world` is missing or `backup` exists.
    fn backup(&self, world: &Path, backup: &Path) -> Result<(), BenchError>;

    /// Replace `world` with the contents of `backup`, then remove `backup`.
    fn restore(&self, world: &Path, backup: &Path) -> Result<(), BenchError>;

    /// Drop a backup whose world was never touched.
    fn discard(&self, backup: &Path) -> Result<(), BenchError>;
}

/// [`WorldStore`] backed by recursive directory copies.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsWorldStore;

impl WorldStore for FsWorldStore {
    #[instrument(skip_all, fields(world = %world.display(), backup = %backup.display()))]
    fn backup(&self, world: &Path, backup: &Path) -> Result<(), BenchError> {
        debug!("backing up world");
        if !world.is_dir() {
            return Err(BenchError::io_precondition(
                "backup world",
                world,
                "world directory does not exist",
            ));
        }
        if backup.exists() {
            return Err(BenchError::io_precondition(
                "backup world",
                backup,
                "backup already exists (pending restore; run `clientbench recover`)",
            ));
        }
        copy_tree(world, backup)
    }

    #[instrument(skip_all, fields(world = %world.display(), backup = %backup.display()))]
    fn restore(&self, world: &Path, backup: &Path) -> Result<(), BenchError> {
        debug!("restoring world");
        if !backup.is_dir() {
            return Err(BenchError::io_precondition(
                "restore world",
                backup,
                "backup directory does not exist",
            ));
        }
        if world.exists() {
            fs::remove_dir_all(world).map_err(|e| BenchError::io("remove world", world, e))?;
        }
        copy_tree(backup, world)?;
        fs::remove_dir_all(backup).map_err(|e| BenchError::io("remove backup", backup, e))?;
        Ok(())
    }

    fn discard(&self, backup: &Path) -> Result<(), BenchError> {
        debug!(backup = %backup.display(), "discarding unused backup");
        if backup.exists() {
            fs::remove_dir_all(backup).map_err(|e| BenchError::io("remove backup", backup, e))?;
        }
        Ok(())
    }
}

/// Whether a backup is waiting to be restored.
pub fn has_pending_backup(backup: &Path) -> bool {
    backup.is_dir()
}

/// Recursively copy `src` to a new directory at `dst`.
///
/// Symlinks are followed; the world format makes no use of them.
fn copy_tree(src: &Path, dst: &Path) -> Result<(), BenchError> {
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            BenchError::io("walk", path, e.into())
        })?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| BenchError::io_precondition("copy", entry.path(), e.to_string()))?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| BenchError::io("create directory", &target, e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| BenchError::io("copy file", &target, e))?;
        }
    }
    Ok(())
}
