//! Subprocess mechanics: spawn, capture, stream, time out, terminate.
//!
//! Everything that forks lives here so both the real platforms and the
//! recording fake share one surface. Spawned children are registered in
//! a [`ProcessRegistry`] for the lifetime of the process and removed
//! exactly once at exit; application shutdown force-terminates whatever
//! is still registered.

use crate::cmd::CommandSpec;
use crate::error::{HalError, HalResult};
use log::{debug, warn};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

/// Exit state of a streamed child, portable across targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitSummary {
    pub code: Option<i32>,
}

impl ExitSummary {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Captured result of a non-streaming run. Unlike `std::process::Output`
/// this can be constructed by test fakes on any target.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// One line of merged child output, tagged by source stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            OutputLine::Stdout(s) | OutputLine::Stderr(s) => s,
        }
    }
}

/// Handle for signalling a live child from another thread.
///
/// Split from [`ChildHandle`] so a cancel path (or the registry) can ask
/// a process to stop while the owning thread is blocked streaming it.
pub trait ProcessController: Send + Sync {
    fn pid(&self) -> u32;

    /// Cooperative stop: SIGTERM where signals exist, `taskkill /T`
    /// elsewhere. Elevated children on Windows do not honor the plain
    /// terminate, hence the tool fallback.
    fn terminate(&self);

    /// Last resort, used by registry shutdown.
    fn force_kill(&self);
}

/// A spawned child owned by the caller.
pub trait ChildHandle: Send {
    fn pid(&self) -> u32;

    fn controller(&self) -> Arc<dyn ProcessController>;

    /// Stream merged stdout/stderr line-wise into `on_line` until the
    /// child exits. Returning `false` from the callback asks the child
    /// to terminate; draining continues until the pipes close.
    fn stream(&mut self, on_line: &mut dyn FnMut(&OutputLine) -> bool) -> HalResult<ExitSummary>;

    /// Wait without consuming output.
    fn wait(&mut self) -> HalResult<ExitSummary>;
}

struct RealController {
    pid: u32,
}

impl ProcessController for RealController {
    fn pid(&self) -> u32 {
        self.pid
    }

    #[cfg(unix)]
    fn terminate(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Err(err) = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            debug!("SIGTERM to {} failed: {err}", self.pid);
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {
        taskkill(self.pid, false);
    }

    #[cfg(unix)]
    fn force_kill(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Err(err) = kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
            debug!("SIGKILL to {} failed: {err}", self.pid);
        }
    }

    #[cfg(not(unix))]
    fn force_kill(&self) {
        taskkill(self.pid, true);
    }
}

#[cfg(not(unix))]
fn taskkill(pid: u32, force: bool) {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.arg("/PID").arg(pid.to_string()).arg("/T");
    if force {
        cmd.arg("/F");
    }
    match cmd.output() {
        Ok(out) if !out.status.success() => {
            debug!("taskkill for {pid} exited {:?}", out.status.code())
        }
        Err(err) => debug!("taskkill for {pid} failed to spawn: {err}"),
        _ => {}
    }
}

/// Registry of every process this layer has spawned and not yet reaped.
#[derive(Default)]
pub struct ProcessRegistry {
    inner: Mutex<HashMap<u32, Arc<dyn ProcessController>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, controller: Arc<dyn ProcessController>) {
        let pid = controller.pid();
        self.inner.lock().unwrap().insert(pid, controller);
    }

    pub fn unregister(&self, pid: u32) {
        self.inner.lock().unwrap().remove(&pid);
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Force-terminate everything still alive. Called on application
    /// shutdown; a cooperative terminate is attempted first so children
    /// that trap signals get to clean up.
    pub fn kill_all(&self) {
        let controllers: Vec<_> = self.inner.lock().unwrap().drain().collect();
        for (pid, controller) in &controllers {
            debug!("terminating registered process {pid}");
            controller.terminate();
        }
        for (_, controller) in &controllers {
            controller.force_kill();
        }
    }
}

struct RealChild {
    program: String,
    child: Child,
    registry: Arc<ProcessRegistry>,
    reaped: bool,
}

impl RealChild {
    fn exit(&mut self, code: Option<i32>) -> ExitSummary {
        if !self.reaped {
            self.registry.unregister(self.child.id());
            self.reaped = true;
        }
        ExitSummary { code }
    }
}

impl ChildHandle for RealChild {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn controller(&self) -> Arc<dyn ProcessController> {
        Arc::new(RealController {
            pid: self.child.id(),
        })
    }

    fn stream(&mut self, on_line: &mut dyn FnMut(&OutputLine) -> bool) -> HalResult<ExitSummary> {
        let (tx, rx) = mpsc::channel::<OutputLine>();

        let mut readers = Vec::new();
        if let Some(stdout) = self.child.stdout.take() {
            readers.push(spawn_line_reader(stdout, tx.clone(), OutputLine::Stdout));
        }
        if let Some(stderr) = self.child.stderr.take() {
            readers.push(spawn_line_reader(stderr, tx.clone(), OutputLine::Stderr));
        }
        drop(tx);

        let controller = self.controller();
        let mut asked_to_stop = false;
        for line in rx {
            if !on_line(&line) && !asked_to_stop {
                asked_to_stop = true;
                controller.terminate();
            }
        }
        for handle in readers {
            let _ = handle.join();
        }

        let status = self.child.wait()?;
        Ok(self.exit(status.code()))
    }

    fn wait(&mut self) -> HalResult<ExitSummary> {
        let status = self.child.wait()?;
        Ok(self.exit(status.code()))
    }
}

impl Drop for RealChild {
    fn drop(&mut self) {
        if !self.reaped {
            // A handle dropped without being waited on leaves the child
            // running; keep it registered so shutdown can reap it, but
            // log because this is almost always a caller bug.
            warn!("child {} ({}) dropped unreaped", self.child.id(), self.program);
        }
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(
    reader: R,
    tx: mpsc::Sender<OutputLine>,
    wrap: fn(String) -> OutputLine,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let buffered = BufReader::new(reader);
        for line in buffered.lines() {
            match line {
                Ok(text) => {
                    if tx.send(wrap(text)).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}

/// Real subprocess engine shared by the concrete platforms.
pub(crate) struct ProcessEngine {
    registry: Arc<ProcessRegistry>,
}

impl ProcessEngine {
    pub(crate) fn new() -> Self {
        Self {
            registry: Arc::new(ProcessRegistry::new()),
        }
    }

    pub(crate) fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    fn spawn_raw(&self, spec: &CommandSpec) -> HalResult<Child> {
        let mut cmd = spec.to_command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| HalError::from_spawn(spec.program(), e))?;
        feed_stdin(&mut child, spec.stdin_bytes());
        Ok(child)
    }

    pub(crate) fn run(&self, spec: &CommandSpec) -> HalResult<RunOutput> {
        debug!("run: {} {:?}", spec.program(), spec.argv_lossy());
        let child = self.spawn_raw(spec)?;
        let output = child.wait_with_output()?;
        Ok(RunOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    pub(crate) fn run_with_timeout(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> HalResult<RunOutput> {
        debug!(
            "run (timeout {}s): {} {:?}",
            timeout.as_secs(),
            spec.program(),
            spec.argv_lossy()
        );
        let mut child = self.spawn_raw(spec)?;

        let stdout = child.stdout.take().map(capture_stream);
        let stderr = child.stderr.take().map(capture_stream);

        let status = match child.wait_timeout(timeout)? {
            Some(status) => status,
            None => {
                child.kill().ok();
                child.wait().ok();
                return Err(HalError::CommandTimeout {
                    program: spec.program().to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }
        };

        Ok(RunOutput {
            code: status.code(),
            stdout: join_capture(stdout),
            stderr: join_capture(stderr),
        })
    }

    pub(crate) fn spawn(&self, spec: &CommandSpec) -> HalResult<Box<dyn ChildHandle>> {
        debug!("spawn: {} {:?}", spec.program(), spec.argv_lossy());
        let child = self.spawn_raw(spec)?;
        let handle = RealChild {
            program: spec.program().to_string(),
            child,
            registry: Arc::clone(&self.registry),
            reaped: false,
        };
        self.registry.register(handle.controller());
        Ok(Box::new(handle))
    }
}

fn feed_stdin(child: &mut Child, payload: Option<&[u8]>) {
    let Some(bytes) = payload else { return };
    if let Some(mut stdin) = child.stdin.take() {
        // A child that never reads (sudo already satisfied, or an
        // already-elevated spawn) closes its end; a broken pipe here is
        // not an error.
        let _ = stdin.write_all(bytes);
    }
}

fn capture_stream<R: Read + Send + 'static>(reader: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let mut reader = reader;
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

fn join_capture(handle: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Check a captured [`RunOutput`] and hand back stdout as UTF-8.
pub fn expect_success(program: &str, output: &RunOutput) -> HalResult<String> {
    if !output.success() {
        return Err(HalError::CommandFailed {
            program: program.to_string(),
            code: output.code,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8(output.stdout.clone())?)
}

/// A command execution seam handed into multi-step platform operations.
///
/// The concrete runner decides how a spec actually executes; the
/// credential broker's runner wraps specs for elevation before spawning,
/// a plain runner executes them as-is.
pub trait CommandRunner {
    fn run_output(&self, spec: CommandSpec) -> HalResult<RunOutput>;

    fn run_streaming(
        &self,
        spec: CommandSpec,
        on_line: &mut dyn FnMut(&OutputLine) -> bool,
    ) -> HalResult<ExitSummary>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingController {
        pid: u32,
        terminated: Arc<AtomicUsize>,
        killed: Arc<AtomicUsize>,
    }

    impl ProcessController for CountingController {
        fn pid(&self) -> u32 {
            self.pid
        }
        fn terminate(&self) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
        fn force_kill(&self) {
            self.killed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn registry_kill_all_terminates_then_force_kills() {
        let registry = ProcessRegistry::new();
        let terminated = Arc::new(AtomicUsize::new(0));
        let killed = Arc::new(AtomicUsize::new(0));

        for pid in 1..=3 {
            registry.register(Arc::new(CountingController {
                pid,
                terminated: Arc::clone(&terminated),
                killed: Arc::clone(&killed),
            }));
        }
        assert_eq!(registry.active_count(), 3);

        registry.kill_all();
        assert_eq!(terminated.load(Ordering::SeqCst), 3);
        assert_eq!(killed.load(Ordering::SeqCst), 3);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn registry_unregister_is_idempotent() {
        let registry = ProcessRegistry::new();
        registry.register(Arc::new(CountingController {
            pid: 7,
            terminated: Arc::new(AtomicUsize::new(0)),
            killed: Arc::new(AtomicUsize::new(0)),
        }));
        registry.unregister(7);
        registry.unregister(7);
        assert_eq!(registry.active_count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn run_captures_stdout() {
        let engine = ProcessEngine::new();
        let out = engine
            .run(&CommandSpec::new("echo").arg("hello"))
            .expect("echo runs");
        assert_eq!(expect_success("echo", &out).unwrap().trim(), "hello");
    }

    #[cfg(unix)]
    #[test]
    fn run_with_timeout_kills_slow_children() {
        let engine = ProcessEngine::new();
        let err = engine
            .run_with_timeout(
                &CommandSpec::new("sleep").arg("5"),
                Duration::from_millis(50),
            )
            .expect_err("sleep must be killed");
        assert!(matches!(err, HalError::CommandTimeout { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn stream_merges_stdout_and_stderr_and_unregisters() {
        let engine = ProcessEngine::new();
        let mut child = engine
            .spawn(
                &CommandSpec::new("sh")
                    .arg("-c")
                    .arg("echo out; echo err 1>&2"),
            )
            .expect("spawn sh");
        assert_eq!(engine.registry().active_count(), 1);

        let mut seen = Vec::new();
        let exit = child
            .stream(&mut |line| {
                seen.push(line.clone());
                true
            })
            .expect("stream");

        assert!(exit.success());
        assert!(seen.contains(&OutputLine::Stdout("out".into())));
        assert!(seen.contains(&OutputLine::Stderr("err".into())));
        assert_eq!(engine.registry().active_count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn stdin_payload_reaches_the_child() {
        let engine = ProcessEngine::new();
        let out = engine
            .run(&CommandSpec::new("cat").stdin_payload(b"fed\n".to_vec()))
            .expect("cat runs");
        assert_eq!(expect_success("cat", &out).unwrap(), "fed\n");
    }
}
