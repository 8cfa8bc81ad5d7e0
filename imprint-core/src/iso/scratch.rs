//! Scratch directory layout for one ISO rebuild, keyed by job id.
//!
//! Three trees under a common base (the OS temp dir): the read-only
//! mount, the mutable contents copy, and a metadata dir holding the
//! extracted boot-partition blob. Distinct job ids never collide.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchPaths {
    pub mount_dir: PathBuf,
    pub contents_dir: PathBuf,
    pub meta_dir: PathBuf,
}

impl ScratchPaths {
    pub fn for_job(job_id: &str) -> Self {
        Self::rooted(&std::env::temp_dir(), job_id)
    }

    /// Layout under an explicit base; tests point this at a tempdir.
    pub fn rooted(base: &Path, job_id: &str) -> Self {
        Self {
            mount_dir: base.join("iso-mount").join(job_id),
            contents_dir: base.join("iso-contents").join(job_id),
            meta_dir: base.join(job_id),
        }
    }

    pub fn partition_blob(&self) -> PathBuf {
        self.meta_dir.join("partition.img")
    }

    pub fn create(&self) -> io::Result<()> {
        fs::create_dir_all(&self.contents_dir)?;
        fs::create_dir_all(&self.meta_dir)
    }
}

/// Remove the scratch trees and optionally a rebuilt ISO. Idempotent;
/// paths that are already gone are fine.
pub fn cleanup(paths: &ScratchPaths, iso: Option<&Path>) {
    for dir in [&paths.mount_dir, &paths.contents_dir, &paths.meta_dir] {
        remove_ignoring_absence(fs::remove_dir_all(dir));
    }
    if let Some(iso) = iso {
        remove_ignoring_absence(fs::remove_file(iso));
    }
}

fn remove_ignoring_absence(result: io::Result<()>) {
    if let Err(err) = result {
        if err.kind() != io::ErrorKind::NotFound {
            log::warn!("scratch cleanup: {err}");
        }
    }
}
