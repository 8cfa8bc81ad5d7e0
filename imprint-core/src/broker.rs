//! Credential broker: the one place that holds the elevation secret and
//! turns plain command specs into privileged executions.
//!
//! A [`CredentialSession`] is an explicit object owned by the caller,
//! not process-global state. The secret inside it only ever travels to
//! a child's stdin via the platform's elevation wrapper; it is never
//! placed in an argv, an environment variable, or a log line.

use crate::errors::{ImprintError, Result};
use anyhow::Context;
use imprint_platform::{
    ChildHandle, CommandRunner, CommandSpec, ExitSummary, HalError, HalResult, OutputLine,
    Platform, RunOutput, Secret,
};
use log::{debug, info};
use std::sync::{Arc, Mutex};

pub struct CredentialSession {
    platform: Arc<dyn Platform>,
    secret: Mutex<Option<Secret>>,
}

impl CredentialSession {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            secret: Mutex::new(None),
        }
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Validate a credential against the live system and commit it only
    /// on success. On rejection any previously held secret is dropped,
    /// so the session is never left half-set.
    pub fn set_credential(&self, secret: Secret) -> Result<()> {
        if self.platform.already_elevated() {
            debug!("process already elevated; no credential needed");
            return Ok(());
        }
        let probe = self.platform.credential_probe(&secret);
        let output = self
            .platform
            .run(&probe)
            .context("running credential probe")?;
        let mut slot = self.secret.lock().unwrap();
        if output.success() {
            info!("🔑 administrator credential accepted");
            *slot = Some(secret);
            Ok(())
        } else {
            *slot = None;
            Err(ImprintError::InvalidCredential.into())
        }
    }

    pub fn clear_credential(&self) {
        *self.secret.lock().unwrap() = None;
    }

    pub fn has_credential(&self) -> bool {
        self.secret.lock().unwrap().is_some()
    }

    /// Re-check the held credential against the live system. Always
    /// probes; a cached acceptance can go stale when sudo rules change.
    pub fn is_credential_valid(&self) -> Result<bool> {
        if self.platform.already_elevated() {
            return Ok(true);
        }
        let secret = match self.secret.lock().unwrap().clone() {
            Some(secret) => secret,
            None => return Ok(false),
        };
        let probe = self.platform.credential_probe(&secret);
        let output = self
            .platform
            .run(&probe)
            .context("running credential probe")?;
        Ok(output.success())
    }

    fn wrap(&self, spec: CommandSpec) -> Result<CommandSpec> {
        let secret = self.secret.lock().unwrap().clone();
        self.platform
            .wrap_elevated(spec, secret.as_ref())
            .map_err(|err| match err {
                HalError::CredentialRequired => ImprintError::InvalidCredential.into(),
                other => anyhow::Error::from(other),
            })
    }

    /// Run an elevated command to completion, capturing its output.
    pub fn run_elevated_output(&self, spec: CommandSpec) -> Result<RunOutput> {
        let program = spec.program().to_string();
        let wrapped = self.wrap(spec)?;
        self.platform
            .run(&wrapped)
            .with_context(|| format!("running {program} elevated"))
    }

    /// Like [`run_elevated_output`], but a non-zero exit is an error and
    /// stdout comes back decoded.
    ///
    /// [`run_elevated_output`]: Self::run_elevated_output
    pub fn run_elevated_checked(&self, spec: CommandSpec) -> Result<String> {
        let program = spec.program().to_string();
        let output = self.run_elevated_output(spec)?;
        if !output.success() {
            debug!(
                "{program} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Err(ImprintError::SubprocessNonZeroExit {
                program,
                code: output.code,
            }
            .into());
        }
        String::from_utf8(output.stdout).context("decoding command output")
    }

    /// Run an elevated command, streaming merged output lines to the
    /// callback. Returning `false` from the callback asks the child to
    /// terminate.
    pub fn run_elevated(
        &self,
        spec: CommandSpec,
        on_line: &mut dyn FnMut(&OutputLine) -> bool,
    ) -> Result<ExitSummary> {
        let mut child = self.spawn_elevated(spec)?;
        child.stream(on_line).context("streaming elevated command")
    }

    /// Spawn an elevated child and hand the live handle to the caller.
    pub fn spawn_elevated(&self, spec: CommandSpec) -> Result<Box<dyn ChildHandle>> {
        let program = spec.program().to_string();
        let wrapped = self.wrap(spec)?;
        self.platform
            .spawn(&wrapped)
            .with_context(|| format!("spawning {program} elevated"))
    }

    /// Force-terminate every process this session's platform has
    /// spawned and not yet reaped. Call on application shutdown.
    pub fn shutdown(&self) {
        info!("shutting down; terminating tracked child processes");
        self.platform.registry().kill_all();
    }
}

/// The session doubles as the command runner handed into multi-step
/// platform operations, so those steps inherit elevation transparently.
impl CommandRunner for CredentialSession {
    fn run_output(&self, spec: CommandSpec) -> HalResult<RunOutput> {
        let secret = self.secret.lock().unwrap().clone();
        let wrapped = self.platform.wrap_elevated(spec, secret.as_ref())?;
        self.platform.run(&wrapped)
    }

    fn run_streaming(
        &self,
        spec: CommandSpec,
        on_line: &mut dyn FnMut(&OutputLine) -> bool,
    ) -> HalResult<ExitSummary> {
        let secret = self.secret.lock().unwrap().clone();
        let wrapped = self.platform.wrap_elevated(spec, secret.as_ref())?;
        let mut child = self.platform.spawn(&wrapped)?;
        child.stream(on_line)
    }
}
