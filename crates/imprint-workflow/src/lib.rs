//! Flash orchestration: per-job state machines sequencing acquisition,
//! ISO rebuild, the elevated flash worker, and post-flash configuration
//! deployment. Jobs run concurrently and independently; each reports
//! through its own event channel.

pub mod job;
pub mod orchestrator;

pub use job::{ConfigPayload, FlashJob, FlashState, ImageSource, JobEvent};
pub use orchestrator::{JobStatus, Orchestrator};
