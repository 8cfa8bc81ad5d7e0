//! Shared data types produced by the platform capability layer.

use serde::{Deserialize, Serialize};

/// One mounted location of a partition on a drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mountpoint {
    pub path: String,
}

impl Mountpoint {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// A block device as seen by the OS enumeration tools.
///
/// A drive snapshot is authoritative only right after enumeration;
/// mount state changes must be observed by re-enumerating, never by
/// mutating a held value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub device_path: String,
    pub description: String,
    pub bus_type: String,
    pub is_removable: bool,
    pub is_system: bool,
    pub is_readonly: bool,
    pub mountpoints: Vec<Mountpoint>,
}

/// One row of a partition-table listing.
///
/// Derived by parsing OS tool output; ephemeral, recomputed per request.
/// Field availability differs per tool: the Unix listing carries block
/// geometry, the macOS listing only type/size/identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Device node or tool identifier (`/dev/sdb1`, `disk2s1`, partition number).
    pub device: String,
    pub boot: bool,
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub sectors: Option<u64>,
    /// Human-readable size as printed by the tool.
    pub size: String,
    /// Partition id code where the tool prints one.
    pub id: Option<String>,
    pub type_name: String,
    /// Volume name for tools that print one.
    pub name: Option<String>,
}

/// Opaque handle returned by an ISO attach, needed later to detach.
///
/// Linux unmounts by mount directory alone; macOS detaches the device
/// node reported at attach time; Windows dismounts by image path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoAttachment {
    MountDirOnly,
    Device(String),
    ImagePath(std::path::PathBuf),
}

/// Result of attaching an ISO: where its tree became readable, plus the
/// handle needed to detach it again.
///
/// The source dir usually equals the requested mount dir; on Windows the
/// volume manager assigns a drive letter instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedIso {
    pub source_dir: std::path::PathBuf,
    pub attachment: IsoAttachment,
}
