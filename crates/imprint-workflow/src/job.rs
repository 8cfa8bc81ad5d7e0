//! Flash job data model and the event stream jobs report through.

use imprint_core::catalog::ImageDescriptor;
use imprint_core::progress::{ProgressSample, Stage};
use imprint_platform::Drive;
use std::fmt;
use std::path::PathBuf;

/// Extension historically used for device configuration files; still
/// what operators hand us today.
pub const LEGACY_CONFIG_EXT: &str = "devconf";
/// Extension newer device firmware looks for. Legacy-named configs are
/// duplicated under this one on the target, best-effort.
pub const CONFIG_EXT: &str = "fleet";

/// User-visible lifecycle of one flash job.
///
/// Within a job, states advance strictly in this order (the optional
/// acquisition and ISO blocks are skipped when not needed); `Failed`
/// can follow any state. Cancellation lands in a canceled sub-state of
/// the stage it interrupted, never back in `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    Idle,
    Starting,
    Downloading,
    Decompressing,
    ExtractingIso,
    RecreatingIso,
    Flashing,
    Verifying,
    Configuring,
    Finished,
    FlashingCanceled,
    VerificationCanceled,
    Failed,
}

impl FlashState {
    /// The state a cancellation maps to. Only the subprocess-backed
    /// stages have canceled sub-states.
    pub fn canceled(self) -> FlashState {
        match self {
            FlashState::Flashing => FlashState::FlashingCanceled,
            FlashState::Verifying => FlashState::VerificationCanceled,
            other => other,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlashState::Finished
                | FlashState::Failed
                | FlashState::FlashingCanceled
                | FlashState::VerificationCanceled
        )
    }
}

impl From<Stage> for FlashState {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Starting => FlashState::Starting,
            Stage::Downloading => FlashState::Downloading,
            Stage::Decompressing => FlashState::Decompressing,
            Stage::ExtractingIso => FlashState::ExtractingIso,
            Stage::RecreatingIso => FlashState::RecreatingIso,
            Stage::Flashing => FlashState::Flashing,
            Stage::Verifying => FlashState::Verifying,
            Stage::Configuring => FlashState::Configuring,
            Stage::Finished => FlashState::Finished,
            Stage::Failed => FlashState::Failed,
        }
    }
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FlashState::Idle => "idle",
            FlashState::Starting => "starting",
            FlashState::Downloading => "downloading",
            FlashState::Decompressing => "decompressing",
            FlashState::ExtractingIso => "extracting-iso",
            FlashState::RecreatingIso => "recreating-iso",
            FlashState::Flashing => "flashing",
            FlashState::Verifying => "verifying",
            FlashState::Configuring => "configuring",
            FlashState::Finished => "finished",
            FlashState::FlashingCanceled => "flashing-canceled",
            FlashState::VerificationCanceled => "verification-canceled",
            FlashState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Where a job's image comes from: a path the operator resolved
/// themselves, or a catalog entry acquired on demand.
#[derive(Debug, Clone)]
pub enum ImageSource {
    LocalPath(PathBuf),
    Catalog(ImageDescriptor),
}

/// Per-device configuration deployed with the image: injected into an
/// installer's tree before mastering, copied onto the target after a
/// raw flash.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigPayload {
    /// File name the payload lands under on the target.
    pub file_name: String,
    pub content: serde_json::Value,
}

impl ConfigPayload {
    /// For a legacy-named config, the same name under the newer
    /// extension; `None` when the name is already current.
    pub fn companion_name(&self) -> Option<String> {
        let stem = self
            .file_name
            .strip_suffix(&format!(".{LEGACY_CONFIG_EXT}"))?;
        Some(format!("{stem}.{CONFIG_EXT}"))
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(&self.content)
    }
}

/// One request to put an image onto one drive.
#[derive(Debug, Clone)]
pub struct FlashJob {
    /// Unique per session; the key for cancellation and process lookup.
    pub id: String,
    pub source: ImageSource,
    pub target_drive: Drive,
    pub config_payload: Option<ConfigPayload>,
}

/// What a running job reports. Every state transition and terminal
/// failure is exactly one event, so a frontend renders without polling.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    State { id: String, state: FlashState },
    Progress { id: String, sample: ProgressSample },
    Failed { id: String, message: String },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::State { id, .. }
            | JobEvent::Progress { id, .. }
            | JobEvent::Failed { id, .. } => id,
        }
    }
}
