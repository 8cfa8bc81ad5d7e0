//! Core library for imprint: removable-media provisioning.
//!
//! Everything above the platform seam lives here: progress accounting,
//! the credential broker, drive/partition inventory policy, the image
//! catalog and acquisition pipeline, the ISO rebuild engine, and the
//! wire protocol spoken to the elevated flash worker. OS specifics stay
//! behind `imprint_platform`; job sequencing lives in
//! `imprint_workflow`.

pub mod acquire;
pub mod broker;
pub mod catalog;
pub mod config;
pub mod errors;
pub mod inventory;
pub mod iso;
pub mod logging;
pub mod progress;
pub mod worker;

mod test_env;

pub use broker::CredentialSession;
pub use config::{ImprintConfig, PollConfig, ToolPaths};
pub use errors::{ImprintError, Result};
pub use progress::{ProgressMessage, ProgressSample, Stage};
