//! Platform capability layer for imprint.
//!
//! Everything OS-specific lives behind the [`Platform`] trait object:
//! subprocess mechanics, privilege elevation, drive inventory, and ISO
//! media handling. Callers obtain one implementation via [`detect`] at
//! startup and share it; tests script a [`FakePlatform`] instead.

pub mod cmd;
pub mod elevate;
pub mod error;
pub mod parse;
pub mod platform;
pub mod process;
pub mod types;

pub use cmd::CommandSpec;
pub use elevate::{ElevationOps, Secret};
pub use error::{HalError, HalResult};
pub use platform::{
    detect, AutomountSupport, DriveOps, FakeChildScript, FakePlatform, LinuxPlatform,
    MacosPlatform, MediaOps, Operation, Platform, ProcessOps, ScriptedRun, WindowsPlatform,
};
pub use process::{
    expect_success, ChildHandle, CommandRunner, ExitSummary, OutputLine, ProcessController,
    ProcessRegistry, RunOutput,
};
pub use types::{Drive, IsoAttachment, MountedIso, Mountpoint, Partition};
