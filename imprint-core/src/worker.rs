//! Wire protocol between the orchestrator and the elevated flash
//! worker.
//!
//! The worker is this same executable re-invoked with a hidden
//! subcommand and the path of a JSON request file; values travel as
//! data, never as generated program text. The worker answers with
//! newline-delimited [`ProgressMessage`] JSON on stdout and its exit
//! status.

use crate::errors::Result;
use crate::progress::ProgressMessage;
use anyhow::Context;
use imprint_platform::CommandSpec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub const WORKER_SUBCOMMAND: &str = "flash-worker";

/// Set by self-contained bundle packaging; when present the bundle
/// path, not the extracted inner executable, must be re-invoked.
pub const APPIMAGE_ENV: &str = "APPIMAGE";

/// What the worker is asked to do: stream `image` onto `device`,
/// optionally reading it back for verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashRequest {
    pub image: PathBuf,
    pub device: PathBuf,
    pub verify: bool,
}

impl FlashRequest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading request {}", path.display()))?;
        serde_json::from_str(&text).context("parsing flash request")
    }
}

/// A request serialized to a uniquely named temp file, removed when the
/// handle drops — whatever the worker's exit status was.
pub struct RequestFile {
    path: PathBuf,
}

impl RequestFile {
    pub fn create(request: &FlashRequest) -> Result<Self> {
        let path = unique_request_path();
        let json = serde_json::to_vec_pretty(request)?;
        fs::write(&path, json)
            .with_context(|| format!("writing request {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RequestFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn unique_request_path() -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "imprint-request-{}-{seq}.json",
        std::process::id()
    ))
}

/// The spawn spec for the worker: this executable (or the surrounding
/// bundle) with the hidden subcommand and the request-file path. The
/// caller wraps it for elevation through its credential session.
pub fn worker_spec(request_path: &Path) -> Result<CommandSpec> {
    let exe = match std::env::var_os(APPIMAGE_ENV).filter(|v| !v.is_empty()) {
        Some(bundle) => PathBuf::from(bundle),
        None => std::env::current_exe().context("resolving the worker executable")?,
    };
    Ok(CommandSpec::new(exe.to_string_lossy().into_owned())
        .arg(WORKER_SUBCOMMAND)
        .arg(request_path))
}

/// Parse one line of worker output. Non-JSON chatter (sudo noise, tool
/// banners) reads as `None` rather than an error.
pub fn parse_progress_line(line: &str) -> Option<ProgressMessage> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::Stage;
    use crate::test_env;

    fn request() -> FlashRequest {
        FlashRequest {
            image: PathBuf::from("/home/op/.imprint/fleet.img"),
            device: PathBuf::from("/dev/sdz"),
            verify: true,
        }
    }

    #[test]
    fn request_file_round_trips_and_cleans_up() {
        let file = RequestFile::create(&request()).unwrap();
        let path = file.path().to_path_buf();
        assert!(path.exists());

        let loaded = FlashRequest::load(&path).unwrap();
        assert_eq!(loaded, request());

        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn request_files_do_not_collide() {
        let a = RequestFile::create(&request()).unwrap();
        let b = RequestFile::create(&request()).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn worker_spec_reinvokes_this_executable() {
        let _env = test_env::lock();
        std::env::remove_var(APPIMAGE_ENV);

        let spec = worker_spec(Path::new("/tmp/req.json")).unwrap();
        let exe = std::env::current_exe().unwrap();
        assert_eq!(spec.program(), exe.to_string_lossy());
        assert_eq!(spec.argv_lossy(), vec![WORKER_SUBCOMMAND, "/tmp/req.json"]);
    }

    #[test]
    fn worker_spec_prefers_the_bundle_path() {
        let _env = test_env::lock();
        let _guard = test_env::EnvVarGuard::set(APPIMAGE_ENV, "/opt/imprint.AppImage");

        let spec = worker_spec(Path::new("/tmp/req.json")).unwrap();
        assert_eq!(spec.program(), "/opt/imprint.AppImage");
    }

    #[test]
    fn progress_lines_parse_and_chatter_is_skipped() {
        let msg = parse_progress_line(
            r#"{"percentage":42.0,"speed":1000.0,"averageSpeed":900.0,"bytesWritten":84,"type":"flashing"}"#,
        )
        .unwrap();
        assert_eq!(msg.stage, Stage::Flashing);
        assert_eq!(msg.bytes_written, 84);
        assert!(!msg.canceled);

        assert!(parse_progress_line("[sudo] password for op:").is_none());
        assert!(parse_progress_line("").is_none());
        assert!(parse_progress_line("{not json}").is_none());
    }
}
