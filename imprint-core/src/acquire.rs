//! Image acquisition: streaming download and gunzip, both reporting
//! progress through the shared meter.
//!
//! Downloads land in a `temp-<name>` file next to the destination and
//! are renamed into place only on success; a failed transfer leaves no
//! partial artifact behind. Decompression refuses anything that is not
//! a `.gz` archive before touching the filesystem.

use crate::catalog::ImageDescriptor;
use crate::errors::{ImprintError, Result};
use crate::progress::{ProgressMeter, ProgressSample, Stage};
use anyhow::Context;
use flate2::read::GzDecoder;
use log::{debug, info};
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const CHUNK: usize = 8192;

/// Size of a remote resource per a HEAD request. A non-success status
/// is a [`ImprintError::DownloadFailure`]; a missing length reads as 0.
pub fn remote_file_size(url: &str) -> Result<u64> {
    let parsed = Url::parse(url).with_context(|| format!("parsing {url}"))?;
    let client = reqwest::blocking::Client::new();
    let response = client
        .head(parsed)
        .send()
        .with_context(|| format!("probing {url}"))?;
    let status = response.status();
    if !status.is_success() {
        return Err(ImprintError::DownloadFailure {
            url: url.to_string(),
            status: status.as_u16(),
        }
        .into());
    }
    // content_length() is the body size hint, which a HEAD response
    // does not have; the header carries the real figure.
    Ok(response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0))
}

/// Stream a descriptor's remote artifact to `dest`.
///
/// Emits an all-zero sample first, throttled samples per chunk, and a
/// final sample at completion. The transfer goes through a `temp-`
/// sibling that is removed before any error propagates.
pub fn download_image(
    descriptor: &ImageDescriptor,
    dest: &Path,
    throttle: Duration,
    emit: &mut dyn FnMut(&ProgressSample),
) -> Result<PathBuf> {
    let url = Url::parse(&descriptor.download_url)
        .with_context(|| format!("parsing {}", descriptor.download_url))?;
    let response = reqwest::blocking::get(url)
        .with_context(|| format!("fetching {}", descriptor.download_url))?;
    let status = response.status();
    if !status.is_success() {
        return Err(ImprintError::DownloadFailure {
            url: descriptor.download_url.clone(),
            status: status.as_u16(),
        }
        .into());
    }

    let temp = temp_sibling(dest)?;
    debug!("downloading {} -> {}", descriptor.download_url, temp.display());
    let total = response.content_length().unwrap_or(0);
    let result = stream_download(response, &temp, dest, total, throttle, emit);
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result?;
    info!("downloaded {}", dest.display());
    Ok(dest.to_path_buf())
}

fn stream_download(
    mut response: reqwest::blocking::Response,
    temp: &Path,
    dest: &Path,
    total: u64,
    throttle: Duration,
    emit: &mut dyn FnMut(&ProgressSample),
) -> Result<()> {
    let mut file = File::create(temp)
        .with_context(|| format!("creating {}", temp.display()))?;
    let mut meter = ProgressMeter::new(Stage::Downloading, total, throttle);
    emit(&meter.zero());

    let mut written = 0u64;
    let mut buffer = [0u8; CHUNK];
    loop {
        let read = response.read(&mut buffer).context("reading download body")?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .with_context(|| format!("writing {}", temp.display()))?;
        written += read as u64;
        if let Some(sample) = meter.sample(written) {
            emit(&sample);
        }
    }
    file.flush()?;
    drop(file);

    fs::rename(temp, dest)
        .with_context(|| format!("moving download into {}", dest.display()))?;
    emit(&meter.final_sample(written));
    Ok(())
}

/// Gunzip `source` next to itself, deriving the target by stripping the
/// `.gz` suffix. Progress is measured in decompressed output bytes
/// against `declared_size` (the catalog's figure, clamped by the meter).
///
/// The compressed source survives; deleting it is the caller's call.
pub fn decompress_gz(
    source: &Path,
    declared_size: u64,
    throttle: Duration,
    emit: &mut dyn FnMut(&ProgressSample),
) -> Result<PathBuf> {
    if source.extension().and_then(|e| e.to_str()) != Some("gz") {
        return Err(ImprintError::DecompressExtensionMismatch(
            source.display().to_string(),
        )
        .into());
    }
    let target = source.with_extension("");
    debug!("decompressing {} -> {}", source.display(), target.display());

    let result = stream_gunzip(source, &target, declared_size, throttle, emit);
    if result.is_err() {
        let _ = fs::remove_file(&target);
    }
    result?;
    info!("decompressed {}", target.display());
    Ok(target)
}

fn stream_gunzip(
    source: &Path,
    target: &Path,
    declared_size: u64,
    throttle: Duration,
    emit: &mut dyn FnMut(&ProgressSample),
) -> Result<()> {
    let file = File::open(source)
        .with_context(|| format!("opening {}", source.display()))?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    let mut out = File::create(target)
        .with_context(|| format!("creating {}", target.display()))?;
    let mut meter = ProgressMeter::new(Stage::Decompressing, declared_size, throttle);
    emit(&meter.zero());

    let mut written = 0u64;
    let mut buffer = [0u8; CHUNK];
    loop {
        let read = decoder
            .read(&mut buffer)
            .with_context(|| format!("decompressing {}", source.display()))?;
        if read == 0 {
            break;
        }
        out.write_all(&buffer[..read])
            .with_context(|| format!("writing {}", target.display()))?;
        written += read as u64;
        if let Some(sample) = meter.sample(written) {
            emit(&sample);
        }
    }
    out.flush()?;
    emit(&meter.final_sample(written));
    Ok(())
}

fn temp_sibling(dest: &Path) -> Result<PathBuf> {
    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .context("destination path has no file name")?;
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    Ok(parent.join(format!("temp-{name}")))
}
