//! Privilege elevation plumbing shared by the unix platforms.
//!
//! The credential is modelled as an opaque [`Secret`] that only ever
//! travels over a child's stdin. Nothing in this module ever places the
//! secret into an argv, an environment variable, or a log line.

use crate::cmd::CommandSpec;
use crate::error::HalResult;
use std::fmt;

/// An elevation credential (the user's sudo password).
///
/// `Debug` is deliberately redacted so the secret cannot leak through
/// error context or trace logging.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Bytes to feed to `sudo -S`, newline-terminated.
    pub fn stdin_payload(&self) -> Vec<u8> {
        let mut bytes = self.0.as_bytes().to_vec();
        bytes.push(b'\n');
        bytes
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Wrap `spec` so it runs under sudo, reading the password from stdin.
///
/// `-S` reads the password from stdin, `-p ""` silences the prompt so it
/// cannot interleave with child output, `-E` preserves the caller's
/// environment (the worker re-invocation depends on it), and `--` stops
/// sudo's own option parsing before the target program.
pub fn sudo_wrap(spec: CommandSpec, secret: &Secret) -> CommandSpec {
    let mut wrapped = CommandSpec::new("sudo")
        .arg("-S")
        .arg("-p")
        .arg("")
        .arg("-E")
        .arg("--")
        .arg(spec.program());
    for arg in spec.argv() {
        wrapped = wrapped.arg(arg.clone());
    }
    for (key, value) in spec.env_vars() {
        wrapped = wrapped.env(key.clone(), value.clone());
    }
    if let Some(dir) = spec.working_dir() {
        wrapped = wrapped.cwd(dir);
    }
    wrapped.stdin_payload(secret.stdin_payload())
}

/// A no-op elevated command used to check that a credential works.
///
/// `-k` discards any cached sudo timestamp first; without it a
/// previously validated session would accept a wrong password.
pub fn sudo_probe(secret: &Secret) -> CommandSpec {
    CommandSpec::new("sudo")
        .arg("-S")
        .arg("-k")
        .arg("-p")
        .arg("")
        .arg("--")
        .arg("true")
        .stdin_payload(secret.stdin_payload())
}

/// Elevation capability of a platform.
pub trait ElevationOps {
    /// Whether the current process already runs with full privileges
    /// (root on unix, an elevated token on Windows).
    fn already_elevated(&self) -> bool;

    /// Rewrite `spec` so it executes with privileges. Identity when the
    /// process is already elevated; `Err(HalError::CredentialRequired)`
    /// when elevation needs a secret and none is supplied.
    fn wrap_elevated(&self, spec: CommandSpec, secret: Option<&Secret>) -> HalResult<CommandSpec>;

    /// A trivial privileged command whose exit status reports whether
    /// `secret` is accepted. Callers run it through `ProcessOps`.
    fn credential_probe(&self, secret: &Secret) -> CommandSpec;
}

#[cfg(unix)]
pub(crate) fn euid_is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
pub(crate) fn euid_is_root() -> bool {
    false
}
