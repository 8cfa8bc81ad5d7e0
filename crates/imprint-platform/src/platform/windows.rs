//! Windows platform implementation.
//!
//! Storage queries go through PowerShell with `ConvertTo-Json` output.
//! Every query is a fixed, constant command text; per-call values reach
//! it through `IMPRINT_*` environment variables, never by splicing them
//! into the command string.

use super::{
    clear_readonly_recursive, copy_dir_recursive, walk_folder_size, AutomountSupport, DriveOps,
    MediaOps, ProcessOps,
};
use crate::cmd::CommandSpec;
use crate::elevate::{ElevationOps, Secret};
use crate::error::{HalError, HalResult};
use crate::parse;
use crate::process::{
    expect_success, ChildHandle, CommandRunner, ProcessEngine, ProcessRegistry, RunOutput,
};
use crate::types::{Drive, IsoAttachment, MountedIso, Mountpoint, Partition};
use log::warn;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const PS_TIMEOUT: Duration = Duration::from_secs(60);

const DISK_QUERY: &str = "Get-Disk | Select-Object Number, FriendlyName, \
     @{n='BusType';e={[string]$_.BusType}}, IsBoot, IsSystem, IsReadOnly, Size \
     | ConvertTo-Json -Depth 3";

const PARTITION_QUERY: &str = "Get-Partition -DiskNumber ([int]$env:IMPRINT_DISK_NUMBER) \
     | Select-Object PartitionNumber, @{n='DriveLetter';e={[string]$_.DriveLetter}}, \
     Size, Type, IsBoot | ConvertTo-Json -Depth 3";

const MOUNT_ISO_QUERY: &str = "$img = Mount-DiskImage -ImagePath $env:IMPRINT_ISO_PATH \
     -Access ReadOnly -PassThru; [string]($img | Get-Volume).DriveLetter";

const DISMOUNT_ISO_QUERY: &str =
    "Dismount-DiskImage -ImagePath $env:IMPRINT_ISO_PATH | Out-Null";

fn powershell(query: &str) -> CommandSpec {
    CommandSpec::new("powershell").args(["-NoProfile", "-NonInteractive", "-Command", query])
}

/// Trailing digits of `\\.\PhysicalDriveN`.
fn disk_number(device_path: &str) -> Option<u64> {
    let digits: String = device_path
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}

/// Real platform for Windows hosts. The installer manifest requires an
/// elevated token, so elevation here is identity.
pub struct WindowsPlatform {
    engine: ProcessEngine,
}

impl WindowsPlatform {
    pub fn new() -> Self {
        Self {
            engine: ProcessEngine::new(),
        }
    }

    fn partition_rows(&self, number: u64) -> HalResult<Vec<Partition>> {
        let spec = powershell(PARTITION_QUERY).env("IMPRINT_DISK_NUMBER", number.to_string());
        let output = self.engine.run_with_timeout(&spec, PS_TIMEOUT)?;
        let stdout = expect_success("powershell", &output)?;
        parse::parse_win_partitions(number, &stdout)
    }
}

impl Default for WindowsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessOps for WindowsPlatform {
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

impl ElevationOps for WindowsPlatform {
    fn already_elevated(&self) -> bool {
        true
    }

    fn wrap_elevated(&self, spec: CommandSpec, _secret: Option<&Secret>) -> HalResult<CommandSpec> {
        Ok(spec)
    }

    fn credential_probe(&self, _secret: &Secret) -> CommandSpec {
        CommandSpec::new("cmd").args(["/C", "exit", "0"])
    }
}

impl DriveOps for WindowsPlatform {
    fn drives(&self) -> HalResult<Vec<Drive>> {
        let output = self.engine.run_with_timeout(&powershell(DISK_QUERY), PS_TIMEOUT)?;
        let stdout = expect_success("powershell", &output)?;
        let mut drives = parse::parse_win_disks(&stdout)?;

        for drive in &mut drives {
            let Some(number) = disk_number(&drive.device_path) else {
                continue;
            };
            match self.partition_rows(number) {
                Ok(rows) => {
                    drive.mountpoints = rows
                        .iter()
                        .filter_map(|p| p.name.clone())
                        .map(Mountpoint::new)
                        .collect();
                }
                Err(err) => warn!("partition query for disk {number} failed: {err}"),
            }
        }
        Ok(drives)
    }

    fn partition_query(&self, device: &str) -> CommandSpec {
        let number = disk_number(device).unwrap_or(0);
        powershell(PARTITION_QUERY).env("IMPRINT_DISK_NUMBER", number.to_string())
    }

    fn partition_query_elevated(&self) -> bool {
        false
    }

    fn parse_partition_listing(&self, device: &str, output: &str) -> HalResult<Vec<Partition>> {
        parse::parse_win_partitions(disk_number(device).unwrap_or(0), output)
    }

    fn automount_support(&self) -> AutomountSupport {
        AutomountSupport::Automatic
    }

    fn settle_query(&self) -> Option<CommandSpec> {
        None
    }

    fn mount_partition_query(&self, _partition_device: &str) -> Option<CommandSpec> {
        None
    }

    // The write primitive dismounts volumes itself before opening the
    // physical device.
    fn unmount_queries(&self, _device: &str, _partition_devices: &[String]) -> Vec<CommandSpec> {
        Vec::new()
    }
}

impl MediaOps for WindowsPlatform {
    fn attach_iso(
        &self,
        iso: &Path,
        _mount_dir: &Path,
        run: &dyn CommandRunner,
    ) -> HalResult<MountedIso> {
        let spec = powershell(MOUNT_ISO_QUERY).env("IMPRINT_ISO_PATH", iso.as_os_str());
        let output = run.run_output(spec)?;
        let stdout = expect_success("powershell", &output)?;
        let letter = stdout
            .trim()
            .chars()
            .find(char::is_ascii_alphabetic)
            .ok_or_else(|| HalError::Parse("Mount-DiskImage reported no drive letter".into()))?;
        Ok(MountedIso {
            source_dir: format!("{letter}:\\").into(),
            attachment: IsoAttachment::ImagePath(iso.to_path_buf()),
        })
    }

    fn detach_iso(
        &self,
        mounted: &MountedIso,
        _mount_dir: &Path,
        run: &dyn CommandRunner,
    ) -> HalResult<()> {
        let IsoAttachment::ImagePath(image) = &mounted.attachment else {
            return Err(HalError::Parse("attachment carries no image path".into()));
        };
        let spec = powershell(DISMOUNT_ISO_QUERY).env("IMPRINT_ISO_PATH", image.as_os_str());
        let output = run.run_output(spec)?;
        expect_success("powershell", &output)?;
        Ok(())
    }

    fn copy_tree(&self, source: &Path, dest: &Path) -> HalResult<()> {
        copy_dir_recursive(source, dest)?;
        Ok(())
    }

    fn folder_size(&self, path: &Path) -> HalResult<u64> {
        walk_folder_size(path)
    }

    fn normalize_tree(&self, path: &Path) -> HalResult<()> {
        clear_readonly_recursive(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_number_takes_trailing_digits() {
        assert_eq!(disk_number(r"\\.\PhysicalDrive2"), Some(2));
        assert_eq!(disk_number(r"\\.\PhysicalDrive17"), Some(17));
        assert_eq!(disk_number(r"\\.\NoDigits"), None);
    }

    #[test]
    fn partition_query_passes_value_through_env() {
        let platform = WindowsPlatform::new();
        let spec = platform.partition_query(r"\\.\PhysicalDrive3");
        assert_eq!(spec.program(), "powershell");
        // Constant command text; the disk number rides in the env.
        assert!(spec.argv_lossy().iter().any(|a| a.contains("IMPRINT_DISK_NUMBER")));
        assert!(spec.argv_lossy().iter().all(|a| !a.contains("PhysicalDrive3")));
        assert!(spec
            .env_vars()
            .iter()
            .any(|(k, v)| k == "IMPRINT_DISK_NUMBER" && v == "3"));
    }

    #[test]
    fn iso_path_never_lands_in_argv() {
        let platform = WindowsPlatform::new();
        struct Deny;
        impl CommandRunner for Deny {
            fn run_output(&self, spec: CommandSpec) -> HalResult<RunOutput> {
                assert!(spec.argv_lossy().iter().all(|a| !a.contains("image.iso")));
                Ok(RunOutput {
                    code: Some(0),
                    stdout: b"E\r\n".to_vec(),
                    stderr: Vec::new(),
                })
            }
            fn run_streaming(
                &self,
                _spec: CommandSpec,
                _on_line: &mut dyn FnMut(&crate::process::OutputLine) -> bool,
            ) -> HalResult<crate::process::ExitSummary> {
                unreachable!("attach never streams")
            }
        }

        let mounted = platform
            .attach_iso(Path::new("C:/images/image.iso"), Path::new("unused"), &Deny)
            .unwrap();
        assert_eq!(mounted.source_dir, std::path::PathBuf::from("E:\\"));
        assert!(matches!(mounted.attachment, IsoAttachment::ImagePath(_)));
    }
}
