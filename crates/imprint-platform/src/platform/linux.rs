//! Linux platform implementation.
//!
//! Inventory comes from `lsblk --json`; partition tables from elevated
//! `fdisk -l`; ISO handling uses loop mounts and `rsync` for the
//! scratch-tree copy.

use super::{AutomountSupport, DriveOps, MediaOps, ProcessOps};
use crate::cmd::CommandSpec;
use crate::elevate::{self, ElevationOps, Secret};
use crate::error::{HalError, HalResult};
use crate::parse;
use crate::process::{
    expect_success, ChildHandle, CommandRunner, ProcessEngine, ProcessRegistry, RunOutput,
};
use crate::types::{Drive, IsoAttachment, MountedIso, Partition};
use log::debug;
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const LSBLK_TIMEOUT: Duration = Duration::from_secs(10);
const DU_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const CHMOD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const LSBLK_COLUMNS: &str = "NAME,PATH,TYPE,RM,RO,TRAN,VENDOR,MODEL,MOUNTPOINT";

/// Real platform for Linux hosts.
pub struct LinuxPlatform {
    engine: ProcessEngine,
}

impl LinuxPlatform {
    pub fn new() -> Self {
        Self {
            engine: ProcessEngine::new(),
        }
    }
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessOps for LinuxPlatform {
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

impl ElevationOps for LinuxPlatform {
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

impl DriveOps for LinuxPlatform {
    fn drives(&self) -> HalResult<Vec<Drive>> {
        let spec = CommandSpec::new("lsblk").args(["--json", "--bytes", "--output", LSBLK_COLUMNS]);
        let output = self.engine.run_with_timeout(&spec, LSBLK_TIMEOUT)?;
        let stdout = expect_success("lsblk", &output)?;
        parse::parse_lsblk_json(&stdout)
    }

    fn partition_query(&self, device: &str) -> CommandSpec {
        CommandSpec::new("fdisk").arg("-l").arg(device)
    }

    fn partition_query_elevated(&self) -> bool {
        true
    }

    fn parse_partition_listing(&self, _device: &str, output: &str) -> HalResult<Vec<Partition>> {
        Ok(parse::parse_fdisk_listing(output))
    }

    fn automount_support(&self) -> AutomountSupport {
        AutomountSupport::Explicit
    }

    fn settle_query(&self) -> Option<CommandSpec> {
        Some(CommandSpec::new("udevadm").arg("settle"))
    }

    fn mount_partition_query(&self, partition_device: &str) -> Option<CommandSpec> {
        Some(
            CommandSpec::new("udisksctl")
                .arg("mount")
                .arg("-b")
                .arg(partition_device),
        )
    }

    fn unmount_queries(&self, _device: &str, partition_devices: &[String]) -> Vec<CommandSpec> {
        partition_devices
            .iter()
            .map(|part| CommandSpec::new("umount").arg(part))
            .collect()
    }
}

impl MediaOps for LinuxPlatform {
    fn attach_iso(
        &self,
        iso: &Path,
        mount_dir: &Path,
        run: &dyn CommandRunner,
    ) -> HalResult<MountedIso> {
        std::fs::create_dir_all(mount_dir)?;
        let spec = CommandSpec::new("mount")
            .arg("-o")
            .arg("loop,ro")
            .arg(iso)
            .arg(mount_dir);
        let output = run.run_output(spec)?;
        expect_success("mount", &output)?;
        Ok(MountedIso {
            source_dir: mount_dir.to_path_buf(),
            attachment: IsoAttachment::MountDirOnly,
        })
    }

    fn detach_iso(
        &self,
        _mounted: &MountedIso,
        mount_dir: &Path,
        run: &dyn CommandRunner,
    ) -> HalResult<()> {
        let output = run.run_output(CommandSpec::new("umount").arg(mount_dir))?;
        expect_success("umount", &output)?;
        Ok(())
    }

    fn copy_tree(&self, source: &Path, dest: &Path) -> HalResult<()> {
        std::fs::create_dir_all(dest)?;
        // Trailing slash: copy the contents of source, not source itself.
        let mut source_arg: OsString = source.as_os_str().to_os_string();
        source_arg.push("/");
        let spec = CommandSpec::new("rsync")
            .arg("-a")
            .arg("--info=progress2")
            .arg(source_arg)
            .arg(dest);
        let mut child = self.engine.spawn(&spec)?;
        let exit = child.stream(&mut |line| {
            debug!("rsync: {}", line.text());
            true
        })?;
        if !exit.success() {
            return Err(HalError::CommandFailed {
                program: "rsync".to_string(),
                code: exit.code,
                stderr: String::new(),
            });
        }
        Ok(())
    }

    fn folder_size(&self, path: &Path) -> HalResult<u64> {
        let spec = CommandSpec::new("du").arg("-sb").arg(path);
        let output = self.engine.run_with_timeout(&spec, DU_TIMEOUT)?;
        let stdout = expect_success("du", &output)?;
        parse::parse_du_size(&stdout)
            .ok_or_else(|| HalError::Parse(format!("du output for {}", path.display())))
    }

    fn normalize_tree(&self, path: &Path) -> HalResult<()> {
        let spec = CommandSpec::new("chmod").arg("-R").arg("u+w").arg(path);
        let output = self.engine.run_with_timeout(&spec, CHMOD_TIMEOUT)?;
        expect_success("chmod", &output)?;
        Ok(())
    }
}
