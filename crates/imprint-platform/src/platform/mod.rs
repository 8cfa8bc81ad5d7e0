//! Platform capability traits and their implementations.
//!
//! One trait object covers everything OS-specific: subprocess mechanics,
//! privilege elevation, drive enumeration, and ISO media handling. Real
//! implementations exist per OS plus a recording [`FakePlatform`] for
//! tests.

pub mod fake;
pub mod linux;
pub mod macos;
pub mod windows;

pub use fake::{FakeChildScript, FakePlatform, Operation, ScriptedRun};
pub use linux::LinuxPlatform;
pub use macos::MacosPlatform;
pub use windows::WindowsPlatform;

use crate::cmd::CommandSpec;
use crate::elevate::ElevationOps;
use crate::error::{HalError, HalResult};
use crate::process::{ChildHandle, CommandRunner, ProcessRegistry, RunOutput};
use crate::types::{Drive, MountedIso, Partition};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Subprocess execution capability.
pub trait ProcessOps {
    fn run(&self, spec: &CommandSpec) -> HalResult<RunOutput>;

    fn run_with_timeout(&self, spec: &CommandSpec, timeout: Duration) -> HalResult<RunOutput>;

    /// Spawn for streaming; the child is registered until reaped.
    fn spawn(&self, spec: &CommandSpec) -> HalResult<Box<dyn ChildHandle>>;

    /// The live-process registry backing this platform.
    fn registry(&self) -> Arc<ProcessRegistry>;
}

/// How removable partitions get mounted after a flash on this OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutomountSupport {
    /// Partitions must be mounted explicitly, one by one.
    #[default]
    Explicit,
    /// The volume manager mounts removable media on its own.
    Automatic,
    /// No sanctioned way to force a mount here.
    Unsupported,
}

/// Drive and partition inventory capability.
///
/// Queries that need elevation are returned as specs for the caller to
/// run through its credential broker; everything else executes directly.
pub trait DriveOps {
    /// Enumerate whole disks with their current mountpoints.
    fn drives(&self) -> HalResult<Vec<Drive>>;

    /// The partition-table listing command for one device.
    fn partition_query(&self, device: &str) -> CommandSpec;

    /// Whether [`DriveOps::partition_query`] must run elevated here.
    fn partition_query_elevated(&self) -> bool;

    /// Parse the output of [`DriveOps::partition_query`].
    fn parse_partition_listing(&self, device: &str, output: &str) -> HalResult<Vec<Partition>>;

    fn automount_support(&self) -> AutomountSupport;

    /// Command to wait for the device layer to settle, where one exists.
    fn settle_query(&self) -> Option<CommandSpec>;

    /// Command to mount one partition, where mounting is explicit.
    fn mount_partition_query(&self, partition_device: &str) -> Option<CommandSpec>;

    /// Commands to unmount a whole disk before writing to it.
    fn unmount_queries(&self, device: &str, partition_devices: &[String]) -> Vec<CommandSpec>;
}

/// ISO attach/detach and scratch-tree handling capability.
pub trait MediaOps {
    /// Attach an ISO read-only. Multi-step platforms run their steps
    /// through `run` so the caller controls elevation.
    fn attach_iso(
        &self,
        iso: &Path,
        mount_dir: &Path,
        run: &dyn CommandRunner,
    ) -> HalResult<MountedIso>;

    fn detach_iso(
        &self,
        mounted: &MountedIso,
        mount_dir: &Path,
        run: &dyn CommandRunner,
    ) -> HalResult<()>;

    /// Copy a directory tree, contents-of-source into dest.
    fn copy_tree(&self, source: &Path, dest: &Path) -> HalResult<()>;

    /// Total byte size of a directory tree.
    fn folder_size(&self, path: &Path) -> HalResult<u64>;

    /// Make an extracted tree writable again (ISO trees come read-only).
    fn normalize_tree(&self, path: &Path) -> HalResult<()>;
}

/// Complete platform surface combining all capability traits.
pub trait Platform: ProcessOps + ElevationOps + DriveOps + MediaOps + Send + Sync {}

/// Automatically implement Platform for any type implementing all required traits.
impl<T> Platform for T where T: ProcessOps + ElevationOps + DriveOps + MediaOps + Send + Sync {}

/// Select the platform implementation for the running OS. Called once
/// at startup; everything downstream shares the returned handle.
pub fn detect() -> HalResult<Arc<dyn Platform>> {
    if cfg!(target_os = "linux") {
        Ok(Arc::new(LinuxPlatform::new()))
    } else if cfg!(target_os = "macos") {
        Ok(Arc::new(MacosPlatform::new()))
    } else if cfg!(target_os = "windows") {
        Ok(Arc::new(WindowsPlatform::new()))
    } else {
        Err(HalError::Unsupported(std::env::consts::OS.to_string()))
    }
}

/// Recursive copy used where no suitable tool exists. Symlinks are
/// copied as the files they point at, matching what a fresh ISO tree
/// needs.
pub(crate) fn copy_dir_recursive(source: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Tree size via directory walk, for platforms without a `du`.
pub(crate) fn walk_folder_size(path: &Path) -> HalResult<u64> {
    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

/// Clear read-only bits across a tree with plain filesystem calls.
pub(crate) fn clear_readonly_recursive(path: &Path) -> std::io::Result<()> {
    for entry in walkdir::WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let mut perms = meta.permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        if perms.readonly() {
            perms.set_readonly(false);
            let _ = std::fs::set_permissions(entry.path(), perms);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn copy_dir_recursive_copies_nested_trees() {
        let scratch = tempfile::tempdir().unwrap();
        let src = scratch.path().join("src");
        fs::create_dir_all(src.join("boot/grub")).unwrap();
        fs::write(src.join("base.cfg"), b"base").unwrap();
        fs::write(src.join("boot/grub/grub.cfg"), b"menu").unwrap();

        let dest = scratch.path().join("dest");
        copy_dir_recursive(&src, &dest).unwrap();

        assert_eq!(fs::read(dest.join("base.cfg")).unwrap(), b"base");
        assert_eq!(fs::read(dest.join("boot/grub/grub.cfg")).unwrap(), b"menu");
    }

    #[test]
    fn walk_folder_size_sums_file_bytes() {
        let scratch = tempfile::tempdir().unwrap();
        fs::write(scratch.path().join("a"), vec![0u8; 100]).unwrap();
        fs::create_dir(scratch.path().join("sub")).unwrap();
        fs::write(scratch.path().join("sub/b"), vec![0u8; 28]).unwrap();

        assert_eq!(walk_folder_size(scratch.path()).unwrap(), 128);
    }
}
