//! Recording fake platform for tests.
//!
//! Records every operation and replays scripted results, so code above
//! the platform seam runs in CI without root, hardware, or network.
//! Filesystem-shaped operations (tree copy, folder size) act on the real
//! filesystem so integration tests can use `tempfile` scratch dirs.

use super::{
    clear_readonly_recursive, copy_dir_recursive, walk_folder_size, AutomountSupport, DriveOps,
    MediaOps, ProcessOps,
};
use crate::cmd::CommandSpec;
use crate::elevate::{self, ElevationOps, Secret};
use crate::error::{HalError, HalResult};
use crate::parse;
use crate::process::{
    ChildHandle, ExitSummary, OutputLine, ProcessController, ProcessRegistry, RunOutput,
};
use crate::types::{Drive, IsoAttachment, MountedIso, Partition};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Recorded platform operation, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Run {
        program: String,
        args: Vec<String>,
        stdin_fed: bool,
    },
    Spawn {
        program: String,
        args: Vec<String>,
        stdin_fed: bool,
    },
    Drives,
    PartitionQuery {
        device: String,
    },
    AttachIso {
        iso: PathBuf,
        mount_dir: PathBuf,
    },
    DetachIso,
    CopyTree {
        source: PathBuf,
        dest: PathBuf,
    },
    FolderSize {
        path: PathBuf,
    },
    NormalizeTree {
        path: PathBuf,
    },
    WrapElevated {
        program: String,
    },
    CredentialProbe,
}

/// Scripted result for one [`ProcessOps::run`] call, keyed by program.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptedRun {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    fn into_output(self) -> RunOutput {
        RunOutput {
            code: Some(self.code),
            stdout: self.stdout.into_bytes(),
            stderr: self.stderr.into_bytes(),
        }
    }
}

/// Scripted behavior for one spawned child.
#[derive(Debug, Clone, Default)]
pub struct FakeChildScript {
    lines: Vec<OutputLine>,
    exit_code: i32,
    hold_until_terminate: bool,
    lines_after_terminate: Vec<OutputLine>,
    exit_after_terminate: i32,
}

impl FakeChildScript {
    /// A child that prints `lines` on stdout and exits 0.
    pub fn emitting<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(|l| OutputLine::Stdout(l.into())).collect(),
            ..Default::default()
        }
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    /// After its scripted lines the child blocks until terminated, then
    /// prints `final_lines` and exits with `exit_code`. Models a worker
    /// that traps the stop signal and reports a canceled stage.
    pub fn hold_until_terminate<I, S>(mut self, final_lines: I, exit_code: i32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hold_until_terminate = true;
        self.lines_after_terminate = final_lines
            .into_iter()
            .map(|l| OutputLine::Stdout(l.into()))
            .collect();
        self.exit_after_terminate = exit_code;
        self
    }
}

#[derive(Default)]
struct TerminateFlag {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl TerminateFlag {
    fn fire(&self) {
        *self.fired.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn is_fired(&self) -> bool {
        *self.fired.lock().unwrap()
    }

    /// Wait for termination, bounded so a mis-scripted test fails
    /// instead of hanging CI.
    fn wait(&self, cap: Duration) -> bool {
        let deadline = Instant::now() + cap;
        let mut fired = self.fired.lock().unwrap();
        while !*fired {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(fired, deadline - now)
                .unwrap();
            fired = guard;
        }
        true
    }
}

struct FakeController {
    pid: u32,
    flag: Arc<TerminateFlag>,
}

impl ProcessController for FakeController {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn terminate(&self) {
        self.flag.fire();
    }

    fn force_kill(&self) {
        self.flag.fire();
    }
}

struct FakeChild {
    pid: u32,
    script: FakeChildScript,
    flag: Arc<TerminateFlag>,
    registry: Arc<ProcessRegistry>,
    reaped: bool,
}

const HOLD_CAP: Duration = Duration::from_secs(60);

impl FakeChild {
    fn exit(&mut self, code: i32) -> ExitSummary {
        if !self.reaped {
            self.registry.unregister(self.pid);
            self.reaped = true;
        }
        ExitSummary { code: Some(code) }
    }

    fn final_code(&self) -> i32 {
        if self.script.hold_until_terminate {
            self.script.exit_after_terminate
        } else {
            self.script.exit_code
        }
    }
}

impl ChildHandle for FakeChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn controller(&self) -> Arc<dyn ProcessController> {
        Arc::new(FakeController {
            pid: self.pid,
            flag: Arc::clone(&self.flag),
        })
    }

    fn stream(&mut self, on_line: &mut dyn FnMut(&OutputLine) -> bool) -> HalResult<ExitSummary> {
        for line in &self.script.lines {
            if !on_line(line) {
                self.flag.fire();
            }
            if self.flag.is_fired() {
                break;
            }
        }
        if self.script.hold_until_terminate {
            self.flag.wait(HOLD_CAP);
            for line in &self.script.lines_after_terminate {
                on_line(line);
            }
            let code = self.script.exit_after_terminate;
            return Ok(self.exit(code));
        }
        let code = self.script.exit_code;
        Ok(self.exit(code))
    }

    fn wait(&mut self) -> HalResult<ExitSummary> {
        if self.script.hold_until_terminate {
            self.flag.wait(HOLD_CAP);
        }
        let code = self.final_code();
        Ok(self.exit(code))
    }
}

#[derive(Default)]
struct FakeState {
    operations: Vec<Operation>,
    run_scripts: HashMap<String, VecDeque<ScriptedRun>>,
    spawn_scripts: HashMap<String, VecDeque<FakeChildScript>>,
    drive_listings: VecDeque<Vec<Drive>>,
    last_drive_listing: Vec<Drive>,
    partition_listings: VecDeque<Vec<Partition>>,
    already_elevated: bool,
    automount: AutomountSupport,
    iso_template: Option<PathBuf>,
}

/// The fake platform. Cloning shares state, so a test can keep a handle
/// for scripting while the code under test owns another.
#[derive(Clone)]
pub struct FakePlatform {
    state: Arc<Mutex<FakeState>>,
    registry: Arc<ProcessRegistry>,
    next_pid: Arc<AtomicU32>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            registry: Arc::new(ProcessRegistry::new()),
            next_pid: Arc::new(AtomicU32::new(9000)),
        }
    }

    fn record(&self, op: Operation) {
        self.state.lock().unwrap().operations.push(op);
    }

    /// Everything recorded so far, in call order.
    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().unwrap().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.state.lock().unwrap().operations.clear();
    }

    /// Queue a result for the next `run` of `program`. Unscripted runs
    /// succeed with empty output.
    pub fn push_run_result(&self, program: impl Into<String>, result: ScriptedRun) {
        self.state
            .lock()
            .unwrap()
            .run_scripts
            .entry(program.into())
            .or_default()
            .push_back(result);
    }

    /// Queue a child for the next `spawn` of `program`.
    pub fn push_spawn_script(&self, program: impl Into<String>, script: FakeChildScript) {
        self.state
            .lock()
            .unwrap()
            .spawn_scripts
            .entry(program.into())
            .or_default()
            .push_back(script);
    }

    /// Queue one drive enumeration result; the last queued listing
    /// repeats once the queue drains (polling sees a stable world).
    pub fn push_drive_listing(&self, drives: Vec<Drive>) {
        self.state.lock().unwrap().drive_listings.push_back(drives);
    }

    /// Queue a parsed partition listing, bypassing the text parser.
    pub fn push_partition_listing(&self, partitions: Vec<Partition>) {
        self.state
            .lock()
            .unwrap()
            .partition_listings
            .push_back(partitions);
    }

    pub fn set_already_elevated(&self, elevated: bool) {
        self.state.lock().unwrap().already_elevated = elevated;
    }

    pub fn set_automount(&self, support: AutomountSupport) {
        self.state.lock().unwrap().automount = support;
    }

    /// Directory tree copied into the mount dir by `attach_iso`, so ISO
    /// extraction tests see real files.
    pub fn set_iso_template(&self, dir: impl Into<PathBuf>) {
        self.state.lock().unwrap().iso_template = Some(dir.into());
    }

    fn pop_run(&self, program: &str) -> RunOutput {
        let mut state = self.state.lock().unwrap();
        state
            .run_scripts
            .get_mut(program)
            .and_then(VecDeque::pop_front)
            .map(ScriptedRun::into_output)
            .unwrap_or_else(|| RunOutput {
                code: Some(0),
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
    }
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessOps for FakePlatform {
    fn run(&self, spec: &CommandSpec) -> HalResult<RunOutput> {
        self.record(Operation::Run {
            program: spec.program().to_string(),
            args: spec.argv_lossy(),
            stdin_fed: spec.has_stdin(),
        });
        Ok(self.pop_run(spec.program()))
    }

    fn run_with_timeout(&self, spec: &CommandSpec, _timeout: Duration) -> HalResult<RunOutput> {
        self.run(spec)
    }

    fn spawn(&self, spec: &CommandSpec) -> HalResult<Box<dyn ChildHandle>> {
        self.record(Operation::Spawn {
            program: spec.program().to_string(),
            args: spec.argv_lossy(),
            stdin_fed: spec.has_stdin(),
        });
        let script = self
            .state
            .lock()
            .unwrap()
            .spawn_scripts
            .get_mut(spec.program())
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();
        let child = FakeChild {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            script,
            flag: Arc::new(TerminateFlag::default()),
            registry: Arc::clone(&self.registry),
            reaped: false,
        };
        self.registry.register(child.controller());
        Ok(Box::new(child))
    }

    fn registry(&self) -> Arc<ProcessRegistry> {
        Arc::clone(&self.registry)
    }
}

impl ElevationOps for FakePlatform {
    fn already_elevated(&self) -> bool {
        self.state.lock().unwrap().already_elevated
    }

    fn wrap_elevated(&self, spec: CommandSpec, secret: Option<&Secret>) -> HalResult<CommandSpec> {
        if self.already_elevated() {
            return Ok(spec);
        }
        let secret = secret.ok_or(HalError::CredentialRequired)?;
        self.record(Operation::WrapElevated {
            program: spec.program().to_string(),
        });
        Ok(elevate::sudo_wrap(spec, secret))
    }

    fn credential_probe(&self, secret: &Secret) -> CommandSpec {
        self.record(Operation::CredentialProbe);
        elevate::sudo_probe(secret)
    }
}

impl DriveOps for FakePlatform {
    fn drives(&self) -> HalResult<Vec<Drive>> {
        self.record(Operation::Drives);
        let mut state = self.state.lock().unwrap();
        if let Some(listing) = state.drive_listings.pop_front() {
            state.last_drive_listing = listing.clone();
            return Ok(listing);
        }
        Ok(state.last_drive_listing.clone())
    }

    fn partition_query(&self, device: &str) -> CommandSpec {
        CommandSpec::new("fdisk").arg("-l").arg(device)
    }

    fn partition_query_elevated(&self) -> bool {
        true
    }

    fn parse_partition_listing(&self, device: &str, output: &str) -> HalResult<Vec<Partition>> {
        self.record(Operation::PartitionQuery {
            device: device.to_string(),
        });
        if let Some(listing) = self
            .state
            .lock()
            .unwrap()
            .partition_listings
            .pop_front()
        {
            return Ok(listing);
        }
        Ok(parse::parse_fdisk_listing(output))
    }

    fn automount_support(&self) -> AutomountSupport {
        self.state.lock().unwrap().automount
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

impl MediaOps for FakePlatform {
    fn attach_iso(
        &self,
        iso: &Path,
        mount_dir: &Path,
        _run: &dyn crate::process::CommandRunner,
    ) -> HalResult<MountedIso> {
        self.record(Operation::AttachIso {
            iso: iso.to_path_buf(),
            mount_dir: mount_dir.to_path_buf(),
        });
        std::fs::create_dir_all(mount_dir)?;
        let template = self.state.lock().unwrap().iso_template.clone();
        if let Some(template) = template {
            copy_dir_recursive(&template, mount_dir)?;
        }
        Ok(MountedIso {
            source_dir: mount_dir.to_path_buf(),
            attachment: IsoAttachment::MountDirOnly,
        })
    }

    fn detach_iso(
        &self,
        _mounted: &MountedIso,
        _mount_dir: &Path,
        _run: &dyn crate::process::CommandRunner,
    ) -> HalResult<()> {
        self.record(Operation::DetachIso);
        Ok(())
    }

    fn copy_tree(&self, source: &Path, dest: &Path) -> HalResult<()> {
        self.record(Operation::CopyTree {
            source: source.to_path_buf(),
            dest: dest.to_path_buf(),
        });
        copy_dir_recursive(source, dest)?;
        Ok(())
    }

    fn folder_size(&self, path: &Path) -> HalResult<u64> {
        self.record(Operation::FolderSize {
            path: path.to_path_buf(),
        });
        walk_folder_size(path)
    }

    fn normalize_tree(&self, path: &Path) -> HalResult<()> {
        self.record(Operation::NormalizeTree {
            path: path.to_path_buf(),
        });
        clear_readonly_recursive(path)?;
        Ok(())
    }
}
