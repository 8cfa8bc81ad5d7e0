//! macOS platform implementation.
//!
//! Inventory is assembled from `diskutil list`, per-disk `diskutil info`
//! and the BSD `mount` table; ISO handling goes through `hdiutil`.

use super::{AutomountSupport, DriveOps, MediaOps, ProcessOps};
use crate::cmd::CommandSpec;
use crate::elevate::{self, ElevationOps, Secret};
use crate::error::{HalError, HalResult};
use crate::parse;
use crate::process::{
    expect_success, ChildHandle, CommandRunner, ProcessEngine, ProcessRegistry, RunOutput,
};
use crate::types::{Drive, IsoAttachment, MountedIso, Mountpoint, Partition};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DISKUTIL_TIMEOUT: Duration = Duration::from_secs(30);
const DU_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const RSYNC_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const CHMOD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Real platform for macOS hosts.
pub struct MacosPlatform {
    engine: ProcessEngine,
}

impl MacosPlatform {
    pub fn new() -> Self {
        Self {
            engine: ProcessEngine::new(),
        }
    }

    fn diskutil_info(&self, device: &str) -> HalResult<Vec<(String, String)>> {
        let spec = CommandSpec::new("diskutil").arg("info").arg(device);
        let output = self.engine.run_with_timeout(&spec, DISKUTIL_TIMEOUT)?;
        let stdout = expect_success("diskutil", &output)?;
        Ok(parse::parse_diskutil_info(&stdout))
    }

    fn mount_table(&self) -> HalResult<Vec<(String, String)>> {
        let output = self
            .engine
            .run_with_timeout(&CommandSpec::new("mount"), DISKUTIL_TIMEOUT)?;
        let stdout = expect_success("mount", &output)?;
        Ok(parse::parse_mount_table(&stdout))
    }
}

impl Default for MacosPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessOps for MacosPlatform {
    fn run(&self, spec: &CommandSpec) -> HalResult<RunOutput> {
        self.engine.run(spec)
    }

    fn run_with_timeout(&self, spec: &CommandSpec, timeout: Duration) -> HalResult<RunOutput> {
        self.engine.run_with_timeout(spec, timeout)
    }

    fn spawn(&self, spec: &CommandSpec) -> HalResult<Box<dyn ChildHandle>> {
        self.engine.spawn(spec)
    }

    fn registry(&self) -> Arc<ProcessRegistry> {
        Arc::clone(self.engine.registry())
    }
}

impl ElevationOps for MacosPlatform {
    fn already_elevated(&self) -> bool {
        elevate::euid_is_root()
    }

    fn wrap_elevated(&self, spec: CommandSpec, secret: Option<&Secret>) -> HalResult<CommandSpec> {
        if self.already_elevated() {
            return Ok(spec);
        }
        match secret {
            Some(secret) => Ok(elevate::sudo_wrap(spec, secret)),
            None => Err(HalError::CredentialRequired),
        }
    }

    fn credential_probe(&self, secret: &Secret) -> CommandSpec {
        elevate::sudo_probe(secret)
    }
}

impl DriveOps for MacosPlatform {
    fn drives(&self) -> HalResult<Vec<Drive>> {
        let listing = self
            .engine
            .run_with_timeout(&CommandSpec::new("diskutil").arg("list"), DISKUTIL_TIMEOUT)?;
        let stdout = expect_success("diskutil", &listing)?;
        let mounts = self.mount_table()?;

        let mut drives = Vec::new();
        for (device, qualifiers) in parse::parse_diskutil_disks(&stdout) {
            let info = match self.diskutil_info(&device) {
                Ok(info) => info,
                // A disk can detach between the listing and the query.
                Err(_) => continue,
            };
            let prefix = format!("{device}s");
            let mountpoints: Vec<Mountpoint> = mounts
                .iter()
                .filter(|(dev, _)| *dev == device || dev.starts_with(&prefix))
                .map(|(_, path)| Mountpoint::new(path.clone()))
                .collect();
            let is_system = qualifiers.contains("internal")
                || mountpoints.iter().any(|m| m.path == "/");

            drives.push(Drive {
                device_path: device,
                description: parse::diskutil_info_value(&info, "Device / Media Name")
                    .unwrap_or_default()
                    .to_string(),
                bus_type: parse::diskutil_info_value(&info, "Protocol")
                    .filter(|p| !p.is_empty())
                    .map(str::to_uppercase)
                    .unwrap_or_else(|| "UNKNOWN".to_string()),
                is_removable: parse::diskutil_info_value(&info, "Removable Media")
                    == Some("Removable"),
                is_system,
                is_readonly: parse::diskutil_info_value(&info, "Read-Only Media")
                    .map(|v| v.starts_with("Yes"))
                    .unwrap_or(false),
                mountpoints,
            });
        }
        Ok(drives)
    }

    fn partition_query(&self, device: &str) -> CommandSpec {
        CommandSpec::new("diskutil").arg("list").arg(device)
    }

    fn partition_query_elevated(&self) -> bool {
        false
    }

    fn parse_partition_listing(&self, _device: &str, output: &str) -> HalResult<Vec<Partition>> {
        Ok(parse::parse_diskutil_listing(output))
    }

    fn automount_support(&self) -> AutomountSupport {
        AutomountSupport::Unsupported
    }

    fn settle_query(&self) -> Option<CommandSpec> {
        None
    }

    fn mount_partition_query(&self, _partition_device: &str) -> Option<CommandSpec> {
        None
    }

    fn unmount_queries(&self, device: &str, _partition_devices: &[String]) -> Vec<CommandSpec> {
        vec![CommandSpec::new("diskutil").arg("unmountDisk").arg(device)]
    }
}

impl MediaOps for MacosPlatform {
    fn attach_iso(
        &self,
        iso: &Path,
        mount_dir: &Path,
        run: &dyn CommandRunner,
    ) -> HalResult<MountedIso> {
        std::fs::create_dir_all(mount_dir)?;
        let attach = CommandSpec::new("hdiutil")
            .arg("attach")
            .arg("-nomount")
            .arg("-readonly")
            .arg(iso);
        let output = run.run_output(attach)?;
        let stdout = expect_success("hdiutil", &output)?;
        let device = parse::parse_hdiutil_attach(&stdout)
            .ok_or_else(|| HalError::Parse("hdiutil attach reported no device".to_string()))?;

        let mount = CommandSpec::new("mount")
            .arg("-t")
            .arg("cd9660")
            .arg("-o")
            .arg("ro")
            .arg(&device)
            .arg(mount_dir);
        let output = run.run_output(mount)?;
        expect_success("mount", &output)?;

        Ok(MountedIso {
            source_dir: mount_dir.to_path_buf(),
            attachment: IsoAttachment::Device(device),
        })
    }

    fn detach_iso(
        &self,
        mounted: &MountedIso,
        _mount_dir: &Path,
        run: &dyn CommandRunner,
    ) -> HalResult<()> {
        let IsoAttachment::Device(device) = &mounted.attachment else {
            return Err(HalError::Parse("attachment carries no device node".to_string()));
        };
        let output = run.run_output(CommandSpec::new("hdiutil").arg("detach").arg(device))?;
        expect_success("hdiutil", &output)?;
        Ok(())
    }

    fn copy_tree(&self, source: &Path, dest: &Path) -> HalResult<()> {
        std::fs::create_dir_all(dest)?;
        let mut source_arg = source.as_os_str().to_os_string();
        source_arg.push("/");
        // The bundled rsync predates --info; run it quiet.
        let spec = CommandSpec::new("rsync").arg("-a").arg(source_arg).arg(dest);
        let output = self.engine.run_with_timeout(&spec, RSYNC_TIMEOUT)?;
        expect_success("rsync", &output)?;
        Ok(())
    }

    fn folder_size(&self, path: &Path) -> HalResult<u64> {
        let spec = CommandSpec::new("du").arg("-sk").arg(path);
        let output = self.engine.run_with_timeout(&spec, DU_TIMEOUT)?;
        let stdout = expect_success("du", &output)?;
        // -sk reports kibibytes.
        parse::parse_du_size(&stdout)
            .map(|kib| kib * 1024)
            .ok_or_else(|| HalError::Parse(format!("du output for {}", path.display())))
    }

    fn normalize_tree(&self, path: &Path) -> HalResult<()> {
        let spec = CommandSpec::new("chmod").arg("-R").arg("u+w").arg(path);
        let output = self.engine.run_with_timeout(&spec, CHMOD_TIMEOUT)?;
        expect_success("chmod", &output)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_query_is_unelevated_diskutil() {
        let platform = MacosPlatform::new();
        let spec = platform.partition_query("/dev/disk4");
        assert_eq!(spec.program(), "diskutil");
        assert_eq!(spec.argv_lossy(), vec!["list", "/dev/disk4"]);
        assert!(!platform.partition_query_elevated());
    }

    #[test]
    fn unmount_targets_the_whole_disk() {
        let platform = MacosPlatform::new();
        let specs = platform.unmount_queries("/dev/disk4", &["/dev/disk4s1".to_string()]);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].argv_lossy(), vec!["unmountDisk", "/dev/disk4"]);
    }

    #[test]
    fn automount_is_not_available() {
        let platform = MacosPlatform::new();
        assert_eq!(platform.automount_support(), AutomountSupport::Unsupported);
        assert!(platform.mount_partition_query("/dev/disk4s1").is_none());
    }
}
