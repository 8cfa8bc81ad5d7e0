//! ISO rebuild engine.
//!
//! Turns an installer ISO into a new hybrid-bootable ISO with extra
//! files injected: mount the original read-only, copy its tree to a
//! scratch dir, write the injected files, then remaster with `xorriso`
//! while reinserting the original's El Torito boot partition at its
//! original block coordinates. Firmware reads the boot image by the
//! absolute block address recorded in the catalog, so the interval must
//! land bit-for-bit where it came from or the result will not boot.

pub mod interval;
pub mod scratch;

pub use interval::BootCatalogInterval;
pub use scratch::ScratchPaths;

use crate::broker::CredentialSession;
use crate::config::ImprintConfig;
use crate::errors::{ImprintError, Result};
use crate::progress::{scan_percent, ProgressSample, Stage};
use anyhow::{bail, Context};
use imprint_platform::{expect_success, CommandSpec, MountedIso};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;

const ISO_VOLUME_LABEL: &str = "IMPRINT";

/// Lifecycle of one rebuild. `Rebuilt` is the terminal success state;
/// detaching afterwards is fire-and-forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildState {
    Idle,
    Mounted,
    Extracted,
    Injected,
    Rebuilt,
    Unmounted,
}

/// One ISO rebuild, keyed by the owning flash job's id.
///
/// Re-entering the same job id before [`IsoJob::cleanup`] is a caller
/// error; the scratch trees would collide.
pub struct IsoJob<'a> {
    session: &'a CredentialSession,
    config: &'a ImprintConfig,
    job_id: String,
    paths: ScratchPaths,
    state: RebuildState,
    attachment: Option<MountedIso>,
}

impl<'a> IsoJob<'a> {
    pub fn new(
        session: &'a CredentialSession,
        config: &'a ImprintConfig,
        job_id: impl Into<String>,
    ) -> Self {
        let job_id = job_id.into();
        let paths = ScratchPaths::for_job(&job_id);
        Self::with_paths(session, config, job_id, paths)
    }

    /// Construct against explicit scratch paths (tests root these in a
    /// tempdir).
    pub fn with_paths(
        session: &'a CredentialSession,
        config: &'a ImprintConfig,
        job_id: impl Into<String>,
        paths: ScratchPaths,
    ) -> Self {
        Self {
            session,
            config,
            job_id: job_id.into(),
            paths,
            state: RebuildState::Idle,
            attachment: None,
        }
    }

    pub fn state(&self) -> RebuildState {
        self.state
    }

    pub fn contents_dir(&self) -> &Path {
        &self.paths.contents_dir
    }

    /// Mount the ISO read-only and copy its tree into the scratch
    /// contents dir.
    ///
    /// Copy progress has no byte counter to watch, so a poller samples
    /// `size(dest)/size(source)` at the configured interval, capped at
    /// 100; poller and copy are torn down together whatever the
    /// outcome.
    pub fn extract_contents(&mut self, iso: &Path, events: &Sender<ProgressSample>) -> Result<()> {
        self.expect_state(&[RebuildState::Idle], "extract")?;
        let platform = self.session.platform();

        let mounted = platform
            .attach_iso(iso, &self.paths.mount_dir, self.session)
            .with_context(|| format!("mounting {}", iso.display()))?;
        let source_dir = mounted.source_dir.clone();
        self.attachment = Some(mounted);
        self.state = RebuildState::Mounted;
        self.paths.create()?;

        let _ = events.send(ProgressSample::zeroed(Stage::ExtractingIso));
        let stop = Arc::new(AtomicBool::new(false));
        let poller = {
            let platform = Arc::clone(platform);
            let stop = Arc::clone(&stop);
            let events = events.clone();
            let source = source_dir.clone();
            let dest = self.paths.contents_dir.clone();
            let interval = self.config.poll.copy_poll;
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    thread::sleep(interval);
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let ratio = match (platform.folder_size(&dest), platform.folder_size(&source))
                    {
                        (Ok(copied), Ok(total)) if total > 0 => {
                            (copied as f64 * 100.0 / total as f64).min(100.0)
                        }
                        _ => continue,
                    };
                    if events
                        .send(ProgressSample::percent_only(Stage::ExtractingIso, ratio))
                        .is_err()
                    {
                        break;
                    }
                }
            })
        };

        let copied = platform.copy_tree(&source_dir, &self.paths.contents_dir);
        stop.store(true, Ordering::SeqCst);
        let _ = poller.join();
        copied.with_context(|| format!("copying ISO tree for job {}", self.job_id))?;

        // Trees come off the ISO read-only; make the copy writable so
        // injection and remastering can work on it.
        if let Err(err) = platform.normalize_tree(&self.paths.contents_dir) {
            warn!("could not normalize extracted tree: {err}");
        }
        let _ = events.send(ProgressSample::percent_only(Stage::ExtractingIso, 100.0));

        info!("extracted {} for job {}", iso.display(), self.job_id);
        self.state = RebuildState::Extracted;
        Ok(())
    }

    /// Write a file into the scratch contents tree.
    pub fn write_file(&mut self, relative_path: &str, data: &[u8]) -> Result<()> {
        self.expect_state(
            &[RebuildState::Extracted, RebuildState::Injected],
            "inject into",
        )?;
        let target = self
            .paths
            .contents_dir
            .join(relative_path.trim_start_matches(['/', '\\']));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, data)
            .with_context(|| format!("writing {}", target.display()))?;
        debug!("injected {relative_path} into job {}", self.job_id);
        self.state = RebuildState::Injected;
        Ok(())
    }

    /// Remaster the scratch tree into a new hybrid-bootable ISO.
    ///
    /// The boot catalog of the **original** ISO is analyzed (not the
    /// scratch copy; the copy has no catalog), its boot partition
    /// extracted as a raw blob, and the blob reinserted at the same
    /// interval coordinates.
    pub fn rebuild(
        &mut self,
        original_iso: &Path,
        events: &Sender<ProgressSample>,
    ) -> Result<PathBuf> {
        self.expect_state(
            &[RebuildState::Extracted, RebuildState::Injected],
            "rebuild",
        )?;
        let platform = self.session.platform();
        let tools = &self.config.tools;

        let report_spec = CommandSpec::new(tools.xorriso.as_str())
            .arg("-indev")
            .arg(original_iso)
            .args(["-report_el_torito", "as_mkisofs"]);
        let output = platform
            .run(&report_spec)
            .context("running boot catalog analysis")?;
        let report = expect_success(&tools.xorriso, &output)?;
        let interval = interval::parse_report(&report)?;
        debug!(
            "boot catalog interval: {}..{} ({}B blocks)",
            interval.start,
            interval.stop,
            interval.unit_bytes()
        );

        self.paths.create()?;
        let blob = self.paths.partition_blob();
        let dd_spec = CommandSpec::new(tools.dd.as_str())
            .arg(format!("if={}", original_iso.display()))
            .arg(format!("of={}", blob.display()))
            .arg(format!("bs={}", interval.unit_bytes()))
            .arg(format!("skip={}", interval.start))
            .arg(format!("count={}", interval.block_count()));
        let output = platform
            .run(&dd_spec)
            .context("extracting boot partition blob")?;
        expect_success(&tools.dd, &output)?;

        let new_iso = rebuilt_path(original_iso, &self.job_id);
        let spec = master_spec(tools, &self.paths.contents_dir, &interval, &blob, &new_iso);

        let _ = events.send(ProgressSample::zeroed(Stage::RecreatingIso));
        let mut child = platform.spawn(&spec).context("spawning ISO mastering")?;
        let exit = child.stream(&mut |line| {
            if let Some(percent) = scan_percent(line.text()) {
                let _ = events.send(ProgressSample::percent_only(Stage::RecreatingIso, percent));
            }
            true
        })?;
        if !exit.success() {
            return Err(ImprintError::SubprocessNonZeroExit {
                program: tools.xorriso.clone(),
                code: exit.code,
            }
            .into());
        }
        let _ = events.send(ProgressSample::percent_only(Stage::RecreatingIso, 100.0));

        let _ = fs::remove_dir_all(&self.paths.meta_dir);
        info!("rebuilt {} for job {}", new_iso.display(), self.job_id);
        self.state = RebuildState::Rebuilt;
        Ok(new_iso)
    }

    /// Unmount the original ISO. Safe to run fire-and-forget after the
    /// rebuilt path has been handed out.
    pub fn detach(&mut self) -> Result<()> {
        let Some(mounted) = self.attachment.take() else {
            return Ok(());
        };
        self.session
            .platform()
            .detach_iso(&mounted, &self.paths.mount_dir, self.session)
            .context("unmounting ISO")?;
        if self.state == RebuildState::Rebuilt {
            self.state = RebuildState::Unmounted;
        }
        Ok(())
    }

    /// Remove the scratch trees and optionally a produced ISO.
    /// Idempotent; missing paths are fine.
    pub fn cleanup(&mut self, iso: Option<&Path>) {
        if let Err(err) = self.detach() {
            warn!("detach during cleanup: {err:#}");
        }
        scratch::cleanup(&self.paths, iso);
    }

    fn expect_state(&self, allowed: &[RebuildState], action: &str) -> Result<()> {
        if !allowed.contains(&self.state) {
            bail!(
                "cannot {action} job {} in state {:?}",
                self.job_id,
                self.state
            );
        }
        Ok(())
    }
}

/// Output path for a rebuild: the original's name minus its extension,
/// suffixed with the job id. Distinct per job, never the original.
pub fn rebuilt_path(original_iso: &Path, job_id: &str) -> PathBuf {
    let stem = original_iso
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    original_iso.with_file_name(format!("{stem}-{job_id}.iso"))
}

/// The mkisofs-compatible mastering invocation, run from inside the
/// contents dir. BIOS boot comes from the isolinux catalog pair, UEFI
/// from the GRUB ESP image, and the hybrid flags keep the result valid
/// as a raw MBR/GPT/APM disk image.
fn master_spec(
    tools: &crate::config::ToolPaths,
    contents_dir: &Path,
    interval: &BootCatalogInterval,
    blob: &Path,
    new_iso: &Path,
) -> CommandSpec {
    CommandSpec::new(tools.xorriso.as_str())
        .args(["-as", "mkisofs"])
        .args(["-r", "-J", "-joliet-long", "-l"])
        .args(["-iso-level", "3"])
        .args(["-V", ISO_VOLUME_LABEL])
        .arg("-isohybrid-mbr")
        .arg(interval.as_argument(blob))
        .args(["-partition_cyl_align", "off"])
        .args(["-partition_offset", "0"])
        .arg("--mbr-force-bootable")
        .args(["-apm-block-size", "2048"])
        .args(["-iso_mbr_part_type", "0x00"])
        .args(["-c", "/isolinux/boot.cat"])
        .args(["-b", "/isolinux/isolinux.bin"])
        .arg("-no-emul-boot")
        .args(["-boot-load-size", "4"])
        .arg("-boot-info-table")
        .arg("-eltorito-alt-boot")
        .args(["-e", "/boot/grub/efi.img"])
        .arg("-no-emul-boot")
        .args(["-boot-load-size", "8000"])
        .arg("-isohybrid-gpt-basdat")
        .arg("-isohybrid-apm-hfsplus")
        .arg("-o")
        .arg(new_iso)
        .arg(".")
        .cwd(contents_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use imprint_platform::{FakeChildScript, FakePlatform, Operation, ScriptedRun, Secret};
    use std::sync::mpsc;

    const REPORT: &str = "\
-V 'Fleet OS'
-isohybrid-mbr --interval:local_fs:0s-15s:zero_mbrpt:'/orig/fleet-installer.iso'
-partition_offset 0
";

    struct Rig {
        fake: FakePlatform,
        session: CredentialSession,
        config: ImprintConfig,
        scratch: tempfile::TempDir,
    }

    impl Rig {
        fn new() -> Self {
            let fake = FakePlatform::new();
            fake.push_run_result("sudo", ScriptedRun::ok(""));
            let session = CredentialSession::new(Arc::new(fake.clone()));
            session.set_credential(Secret::new("pw")).unwrap();
            let scratch = tempfile::tempdir().unwrap();
            let mut config = ImprintConfig::load_from(scratch.path()).unwrap();
            config.poll.copy_poll = std::time::Duration::from_millis(1);
            Self {
                fake,
                session,
                config,
                scratch,
            }
        }

        fn template(&self) -> PathBuf {
            let template = self.scratch.path().join("template");
            fs::create_dir_all(template.join("isolinux")).unwrap();
            fs::write(template.join("isolinux/isolinux.bin"), vec![0u8; 2048]).unwrap();
            fs::write(template.join("base.squashfs"), vec![1u8; 8192]).unwrap();
            self.fake.set_iso_template(&template);
            template
        }

        fn job(&self, id: &str) -> IsoJob<'_> {
            let paths = ScratchPaths::rooted(self.scratch.path(), id);
            IsoJob::with_paths(&self.session, &self.config, id, paths)
        }
    }

    #[test]
    fn extract_copies_the_tree_and_reports_completion() {
        let rig = Rig::new();
        rig.template();
        let mut job = rig.job("job-1");
        let (tx, rx) = mpsc::channel();

        job.extract_contents(Path::new("/orig/fleet.iso"), &tx).unwrap();
        drop(tx);

        assert_eq!(job.state(), RebuildState::Extracted);
        assert!(job.contents_dir().join("isolinux/isolinux.bin").exists());
        assert!(job.contents_dir().join("base.squashfs").exists());

        let samples: Vec<ProgressSample> = rx.iter().collect();
        assert!(samples
            .iter()
            .all(|s| s.stage == Stage::ExtractingIso && s.percentage <= 100.0));
        assert_eq!(samples.last().unwrap().percentage, 100.0);

        let ops = rig.fake.operations();
        assert!(ops.iter().any(|op| matches!(op, Operation::AttachIso { .. })));
        assert!(ops.iter().any(|op| matches!(op, Operation::CopyTree { .. })));
        assert!(ops.iter().any(|op| matches!(op, Operation::NormalizeTree { .. })));
    }

    #[test]
    fn inject_writes_under_the_contents_dir() {
        let rig = Rig::new();
        rig.template();
        let mut job = rig.job("job-2");
        let (tx, _rx) = mpsc::channel();
        job.extract_contents(Path::new("/orig/fleet.iso"), &tx).unwrap();

        job.write_file("fleet.devconf", b"{\"ssid\":\"lab\"}").unwrap();
        job.write_file("/boot/extra/seed.json", b"{}").unwrap();

        assert_eq!(job.state(), RebuildState::Injected);
        assert_eq!(
            fs::read(job.contents_dir().join("fleet.devconf")).unwrap(),
            b"{\"ssid\":\"lab\"}"
        );
        assert!(job.contents_dir().join("boot/extra/seed.json").exists());
    }

    #[test]
    fn inject_before_extract_is_a_caller_error() {
        let rig = Rig::new();
        let mut job = rig.job("job-3");
        assert!(job.write_file("x", b"y").is_err());
        let (tx, _rx) = mpsc::channel();
        assert!(job.rebuild(Path::new("/orig/fleet.iso"), &tx).is_err());
    }

    #[test]
    fn rebuild_reinserts_the_interval_at_its_coordinates() {
        let rig = Rig::new();
        rig.template();
        let mut job = rig.job("job-4");
        let (tx, rx) = mpsc::channel();
        let original = rig.scratch.path().join("fleet-installer.iso");
        fs::write(&original, b"iso").unwrap();

        job.extract_contents(&original, &tx).unwrap();
        rig.fake.push_run_result("xorriso", ScriptedRun::ok(REPORT));
        rig.fake.push_spawn_script(
            "xorriso",
            FakeChildScript::emitting([
                "xorriso : UPDATE :  12.31% done",
                "xorriso : UPDATE :  86.04% done",
            ]),
        );

        let new_iso = job.rebuild(&original, &tx).unwrap();
        drop(tx);

        assert_eq!(job.state(), RebuildState::Rebuilt);
        assert_eq!(
            new_iso,
            rig.scratch.path().join("fleet-installer-job-4.iso")
        );

        let ops = rig.fake.operations();
        let runs: Vec<(String, Vec<String>)> = ops
            .iter()
            .filter_map(|op| match op {
                Operation::Run { program, args, .. } => Some((program.clone(), args.clone())),
                _ => None,
            })
            .collect();
        // Analysis ran against the original, unelevated.
        assert!(runs.iter().any(|(p, args)| {
            p == "xorriso"
                && args.contains(&"-report_el_torito".to_string())
                && args.iter().any(|a| a.contains("fleet-installer.iso"))
        }));
        // dd pulled exactly the interval's 16 2048-byte blocks.
        let dd = runs.iter().find(|(p, _)| p == "dd").expect("dd ran");
        assert!(dd.1.contains(&"bs=2048".to_string()));
        assert!(dd.1.contains(&"skip=0".to_string()));
        assert!(dd.1.contains(&"count=16".to_string()));

        // Mastering got the interval argument pointing at the blob.
        let master = ops
            .iter()
            .find_map(|op| match op {
                Operation::Spawn { program, args, .. } if program == "xorriso" => {
                    Some(args.clone())
                }
                _ => None,
            })
            .expect("mastering spawned");
        assert_eq!(master[..2], ["-as".to_string(), "mkisofs".to_string()]);
        let interval_arg = master
            .iter()
            .find(|a| a.starts_with("--interval:"))
            .expect("interval reinserted");
        assert!(interval_arg.starts_with("--interval:local_fs:0s-15s:zero_mbrpt:"));
        // The blob path is the bare argv element, not a shell-quoted one.
        assert!(interval_arg.ends_with("partition.img"), "{interval_arg}");
        assert!(!interval_arg.contains('\''));
        assert!(master.contains(&"--mbr-force-bootable".to_string()));
        assert!(master.contains(&new_iso.display().to_string()));

        // Metadata dir is gone; progress carried mastering percents.
        assert!(!rig.scratch.path().join("job-4").exists());
        let percents: Vec<f64> = rx
            .iter()
            .filter(|s| s.stage == Stage::RecreatingIso)
            .map(|s| s.percentage)
            .collect();
        assert!(percents.contains(&12.31));
        assert_eq!(percents.last(), Some(&100.0));
    }

    #[test]
    fn rebuild_fails_cleanly_on_a_catalogless_iso() {
        let rig = Rig::new();
        rig.template();
        let mut job = rig.job("job-5");
        let (tx, _rx) = mpsc::channel();
        job.extract_contents(Path::new("/orig/plain.iso"), &tx).unwrap();

        rig.fake
            .push_run_result("xorriso", ScriptedRun::ok("-V 'PLAIN'\n"));
        let err = job.rebuild(Path::new("/orig/plain.iso"), &tx).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImprintError>(),
            Some(ImprintError::BootCatalogParseFailure(_))
        ));
    }

    #[test]
    fn rebuilt_paths_are_distinct_per_job_and_never_the_original() {
        let original = Path::new("/images/fleet-installer.iso");
        let a = rebuilt_path(original, "job-1");
        let b = rebuilt_path(original, "job-2");
        assert_ne!(a, b);
        assert_ne!(a, original);
        assert_ne!(b, original);
        assert_eq!(a, Path::new("/images/fleet-installer-job-1.iso"));
    }

    #[test]
    fn cleanup_detaches_and_removes_scratch_state() {
        let rig = Rig::new();
        rig.template();
        let mut job = rig.job("job-6");
        let (tx, _rx) = mpsc::channel();
        job.extract_contents(Path::new("/orig/fleet.iso"), &tx).unwrap();
        let contents = job.contents_dir().to_path_buf();

        job.cleanup(None);
        assert!(!contents.exists());
        assert!(rig
            .fake
            .operations()
            .iter()
            .any(|op| matches!(op, Operation::DetachIso)));

        // Idempotent.
        job.cleanup(None);
    }
}
