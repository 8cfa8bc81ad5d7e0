//! Runtime configuration: per-user data dir, catalog location, polling
//! intervals, and external tool paths.
//!
//! Values come from built-in defaults, overlaid by an optional
//! `config.toml` in the data dir, overlaid by `IMPRINT_*` environment
//! variables. Polling intervals are deliberately part of this surface
//! so nothing downstream hardcodes a wait.

use crate::errors::Result;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_DIR_ENV: &str = "IMPRINT_CONFIG_DIR";
pub const CATALOG_URL_ENV: &str = "IMPRINT_CATALOG_URL";

const DEFAULT_CATALOG_BASE: &str = "https://downloads.imprint-project.io";
const CONFIG_FILE: &str = "config.toml";

/// How often the slow paths poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Interval between drive re-enumerations while waiting for a mount.
    pub mount_poll: Duration,
    /// Interval between size probes during an ISO tree copy.
    pub copy_poll: Duration,
    /// Minimum spacing between emitted progress samples.
    pub progress_throttle: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            mount_poll: Duration::from_millis(1000),
            copy_poll: Duration::from_millis(1000),
            progress_throttle: Duration::from_millis(250),
        }
    }
}

/// Where the external tools live. Plain program names resolve through
/// PATH; bundled installs point these at absolute paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub xorriso: String,
    pub dd: String,
    pub rsync: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            xorriso: "xorriso".to_string(),
            dd: "dd".to_string(),
            rsync: "rsync".to_string(),
        }
    }
}

/// Resolved configuration, shared read-only after startup.
#[derive(Debug, Clone)]
pub struct ImprintConfig {
    /// Per-user data dir holding the catalog, images, and logs.
    pub config_dir: PathBuf,
    /// Base URL the image catalog is fetched from.
    pub catalog_url: String,
    pub poll: PollConfig,
    pub tools: ToolPaths,
}

/// On-disk `config.toml` shape; everything optional.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    catalog_url: Option<String>,
    #[serde(default)]
    poll: FilePoll,
    #[serde(default)]
    tools: FileTools,
}

#[derive(Debug, Default, Deserialize)]
struct FilePoll {
    mount_ms: Option<u64>,
    copy_ms: Option<u64>,
    throttle_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileTools {
    xorriso: Option<String>,
    dd: Option<String>,
    rsync: Option<String>,
}

impl ImprintConfig {
    /// Load configuration, creating the data dir if needed.
    pub fn load() -> Result<Self> {
        let config_dir = resolve_config_dir()?;
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("creating data dir {}", config_dir.display()))?;
        Self::load_from(&config_dir)
    }

    /// Load against an explicit data dir (tests use a scratch dir).
    pub fn load_from(config_dir: &Path) -> Result<Self> {
        let file = read_file_config(&config_dir.join(CONFIG_FILE))?;

        let catalog_url = std::env::var(CATALOG_URL_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .or(file.catalog_url)
            .unwrap_or_else(|| DEFAULT_CATALOG_BASE.to_string());

        let defaults = PollConfig::default();
        let poll = PollConfig {
            mount_poll: file
                .poll
                .mount_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.mount_poll),
            copy_poll: file
                .poll
                .copy_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.copy_poll),
            progress_throttle: file
                .poll
                .throttle_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.progress_throttle),
        };

        let tool_defaults = ToolPaths::default();
        let tools = ToolPaths {
            xorriso: file.tools.xorriso.unwrap_or(tool_defaults.xorriso),
            dd: file.tools.dd.unwrap_or(tool_defaults.dd),
            rsync: file.tools.rsync.unwrap_or(tool_defaults.rsync),
        };

        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            catalog_url,
            poll,
            tools,
        })
    }

    pub fn log_file(&self) -> PathBuf {
        self.config_dir.join("imprint.log")
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn resolve_config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .context("neither HOME nor USERPROFILE is set")?;
    Ok(PathBuf::from(home).join(".imprint"))
}
