//! Drive and partition inventory.
//!
//! Enumeration itself is platform work; this module owns the selection
//! policy (which drives are safe targets), the elevation plumbing for
//! partition listings, and the post-flash mount handling.

use crate::broker::CredentialSession;
use crate::config::PollConfig;
use crate::errors::{ImprintError, Result};
use anyhow::Context;
use imprint_platform::{expect_success, AutomountSupport, Drive, Partition, Platform};
use log::{debug, info, warn};
use std::sync::Arc;

/// Whether a drive may be offered as a flash target.
///
/// Rejected: anything mounted under a boot path, buses the OS could not
/// identify, system disks, and read-only media.
pub fn is_eligible(drive: &Drive) -> bool {
    if drive.mountpoints.iter().any(|m| m.path.contains("boot")) {
        return false;
    }
    if drive.bus_type == "UNKNOWN" {
        return false;
    }
    !drive.is_system && !drive.is_readonly
}

/// Enumerate drives and keep only eligible targets.
pub fn list_drives(platform: &Arc<dyn Platform>) -> Result<Vec<Drive>> {
    let all = platform.drives().context("enumerating drives")?;
    let drives: Vec<Drive> = all.into_iter().filter(is_eligible).collect();
    debug!("{} eligible drive(s)", drives.len());
    Ok(drives)
}

/// List the partition table of one device, elevating where the platform
/// listing tool requires it.
pub fn partitions(session: &CredentialSession, device: &str) -> Result<Vec<Partition>> {
    let platform = session.platform();
    let spec = platform.partition_query(device);
    let listing = if platform.partition_query_elevated() {
        session.run_elevated_checked(spec)?
    } else {
        let program = spec.program().to_string();
        let output = platform.run(&spec).context("listing partitions")?;
        expect_success(&program, &output)?
    };
    let rows = platform.parse_partition_listing(device, &listing)?;
    debug!("{}: {} partition(s)", device, rows.len());
    Ok(rows)
}

/// Mount every partition of a freshly written drive.
///
/// Where the volume manager already does this it is a no-op; where
/// nothing can, the caller gets a clear error instead of silence.
/// Individual partitions failing to mount (swap, ESP duplicates) are
/// logged and skipped.
pub fn automount(session: &CredentialSession, device: &str) -> Result<()> {
    let platform = session.platform();
    match platform.automount_support() {
        AutomountSupport::Automatic => {
            debug!("{device}: volume manager handles mounting");
            return Ok(());
        }
        AutomountSupport::Unsupported => {
            return Err(ImprintError::UnsupportedPlatform("automount".to_string()).into());
        }
        AutomountSupport::Explicit => {}
    }

    let rows = partitions(session, device)?;
    if let Some(settle) = platform.settle_query() {
        if let Err(err) = session.run_elevated_output(settle) {
            warn!("device settle failed: {err:#}");
        }
    }
    for row in &rows {
        let Some(spec) = platform.mount_partition_query(&row.device) else {
            continue;
        };
        match session.run_elevated_output(spec) {
            Ok(output) if output.success() => debug!("mounted {}", row.device),
            Ok(output) => warn!(
                "mount of {} failed: {}",
                row.device,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(err) => warn!("mount of {} failed: {err:#}", row.device),
        }
    }
    info!("🔌 automount finished for {device}");
    Ok(())
}

/// Poll the drive list until a removable drive with `description` shows
/// up with at least one mountpoint, then return its fresh snapshot.
///
/// Deliberately unbounded: how long a user takes to re-plug a stick is
/// not ours to guess. The interval comes from config.
pub fn wait_for_mount(
    platform: &Arc<dyn Platform>,
    poll: &PollConfig,
    description: &str,
) -> Result<Drive> {
    info!("waiting for {description} to mount");
    loop {
        let drives = platform.drives().context("enumerating drives")?;
        if let Some(drive) = drives.into_iter().find(|d| {
            d.is_removable && d.description == description && !d.mountpoints.is_empty()
        }) {
            info!("{} mounted at {} path(s)", drive.device_path, drive.mountpoints.len());
            return Ok(drive);
        }
        std::thread::sleep(poll.mount_poll);
    }
}

/// Unmount everything on a disk before writing to it. Per-partition
/// failures (already unmounted) are logged, not fatal.
pub fn unmount_disk(session: &CredentialSession, device: &str) -> Result<()> {
    let platform = session.platform();
    let rows = partitions(session, device)?;
    let partition_devices: Vec<String> = rows.iter().map(|p| p.device.clone()).collect();
    for spec in platform.unmount_queries(device, &partition_devices) {
        let target = spec.argv_lossy().join(" ");
        match session.run_elevated_output(spec) {
            Ok(output) if output.success() => debug!("unmounted {target}"),
            Ok(output) => debug!(
                "unmount {target}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(err) => warn!("unmount {target}: {err:#}"),
        }
    }
    Ok(())
}
