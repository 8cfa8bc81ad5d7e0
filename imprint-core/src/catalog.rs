//! Supported-image catalog and the per-user image cache.
//!
//! The catalog is a JSON list of [`ImageDescriptor`]s fetched from the
//! configured base URL and cached in the data dir, so a workstation that
//! already pulled it keeps working offline. Downloaded images live next
//! to it, named after their catalog entry minus the `.gz` suffix.

use crate::config::ImprintConfig;
use crate::errors::{ImprintError, Result};
use anyhow::Context;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

pub const CATALOG_FILE: &str = "supportedImages.json";

/// Whether an image is written as-is or rebuilt as an installer ISO
/// before flashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsVariant {
    Raw,
    Installer,
}

impl OsVariant {
    pub fn is_installer(&self) -> bool {
        matches!(self, OsVariant::Installer)
    }
}

/// One catalog entry. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDescriptor {
    pub download_url: String,
    /// Name of the compressed artifact, e.g. `fleet-os-2.1.img.gz`.
    pub file_name: String,
    /// Checksum of the decompressed image, when the catalog carries one.
    #[serde(default)]
    pub sha256: Option<String>,
    /// Declared decompressed size in bytes.
    pub size_bytes: u64,
    pub os_variant: OsVariant,
}

pub fn catalog_path(config: &ImprintConfig) -> PathBuf {
    config.config_dir.join(CATALOG_FILE)
}

/// Where the compressed download lands.
pub fn compressed_path(config: &ImprintConfig, descriptor: &ImageDescriptor) -> PathBuf {
    config.config_dir.join(&descriptor.file_name)
}

/// Where the ready-to-flash image lands: the catalog name minus `.gz`.
pub fn image_path(config: &ImprintConfig, descriptor: &ImageDescriptor) -> PathBuf {
    let name = descriptor
        .file_name
        .strip_suffix(".gz")
        .unwrap_or(&descriptor.file_name);
    config.config_dir.join(name)
}

/// Fetch the catalog, caching it in the data dir. A failed fetch falls
/// back to the cached copy when one exists.
pub fn fetch_catalog(config: &ImprintConfig) -> Result<Vec<ImageDescriptor>> {
    let url = format!(
        "{}/{}",
        config.catalog_url.trim_end_matches('/'),
        CATALOG_FILE
    );
    match fetch_catalog_text(&url) {
        Ok(text) => {
            let parsed = parse_catalog(&text)?;
            if let Err(err) = fs::write(catalog_path(config), &text) {
                warn!("could not cache catalog: {err}");
            }
            Ok(parsed)
        }
        Err(err) => match load_cached_catalog(config)? {
            Some(cached) => {
                warn!("catalog fetch failed ({err:#}); using cached copy");
                Ok(cached)
            }
            None => Err(err),
        },
    }
}

/// The cached catalog, if one has been fetched before.
pub fn load_cached_catalog(config: &ImprintConfig) -> Result<Option<Vec<ImageDescriptor>>> {
    let path = catalog_path(config);
    if !path.exists() {
        return Ok(None);
    }
    let text =
        fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    Ok(Some(parse_catalog(&text)?))
}

/// Look up a catalog entry by its artifact name (with or without `.gz`).
pub fn find<'a>(catalog: &'a [ImageDescriptor], name: &str) -> Option<&'a ImageDescriptor> {
    catalog
        .iter()
        .find(|d| d.file_name == name || d.file_name.strip_suffix(".gz") == Some(name))
}

/// A verified cache hit for a descriptor: the decompressed image exists
/// and, when the catalog carries a checksum, matches it. A mismatched
/// file reads as a miss so acquisition re-downloads it.
pub fn cached_image(
    config: &ImprintConfig,
    descriptor: &ImageDescriptor,
) -> Result<Option<PathBuf>> {
    let path = image_path(config, descriptor);
    if !path.exists() {
        return Ok(None);
    }
    if let Some(expected) = &descriptor.sha256 {
        let actual = sha256_hex(&path)?;
        if !actual.eq_ignore_ascii_case(expected) {
            warn!("{} fails checksum; treating as cache miss", path.display());
            return Ok(None);
        }
    }
    debug!("cache hit: {}", path.display());
    Ok(Some(path))
}

/// Streaming SHA-256 of a file, lowercase hex.
pub fn sha256_hex(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn fetch_catalog_text(url: &str) -> Result<String> {
    let response = reqwest::blocking::get(url).with_context(|| format!("fetching {url}"))?;
    let status = response.status();
    if !status.is_success() {
        return Err(ImprintError::DownloadFailure {
            url: url.to_string(),
            status: status.as_u16(),
        }
        .into());
    }
    response.text().context("reading catalog body")
}

fn parse_catalog(text: &str) -> Result<Vec<ImageDescriptor>> {
    serde_json::from_str(text).context("parsing image catalog")
}
