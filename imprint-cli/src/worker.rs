//! The elevated flash worker: streams an image onto a device, reads it
//! back for verification, and reports newline-delimited progress JSON
//! on stdout. Logging goes to stderr; stdout belongs to the protocol.

use anyhow::{bail, Context, Result};
use imprint_core::progress::{percentage, ProgressMeter, ProgressMessage, ProgressSample, Stage};
use imprint_core::worker::FlashRequest;
use log::{error, info};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const CHUNK_SIZE: usize = 1024 * 1024;
const THROTTLE: Duration = Duration::from_millis(250);

static CANCELED: AtomicBool = AtomicBool::new(false);

pub enum Outcome {
    Completed,
    Canceled,
}

/// Worker entry point: load the request, do the work, map the result to
/// an exit code. Never panics back into the elevated wrapper.
pub fn run(request_path: &Path) -> i32 {
    install_cancel_handler();
    let request = match FlashRequest::load(request_path) {
        Ok(request) => request,
        Err(err) => {
            error!("bad flash request: {err:#}");
            return 2;
        }
    };

    let stdout = io::stdout();
    let mut emit = |msg: &ProgressMessage| {
        if let Ok(line) = serde_json::to_string(msg) {
            let mut out = stdout.lock();
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
    };

    match flash_and_verify(&request, THROTTLE, &CANCELED, &mut emit) {
        Ok(Outcome::Completed) => 0,
        Ok(Outcome::Canceled) => {
            info!("flash of {} canceled", request.device.display());
            3
        }
        Err(err) => {
            error!("flash of {} failed: {err:#}", request.device.display());
            emit(&ProgressMessage::from_sample(&ProgressSample::zeroed(
                Stage::Failed,
            )));
            1
        }
    }
}

/// Stream the image onto the device in fixed chunks, fsync, then read
/// the device back and compare SHA-256 against what was written.
///
/// The cancel flag is checked once per chunk; cancellation emits one
/// final message tagged with the interrupted stage.
pub fn flash_and_verify(
    request: &FlashRequest,
    throttle: Duration,
    canceled: &AtomicBool,
    emit: &mut dyn FnMut(&ProgressMessage),
) -> Result<Outcome> {
    let mut source = File::open(&request.image)
        .with_context(|| format!("opening {}", request.image.display()))?;
    let total = source
        .metadata()
        .with_context(|| format!("sizing {}", request.image.display()))?
        .len();
    let mut device = OpenOptions::new()
        .write(true)
        .create(true)
        .open(&request.device)
        .with_context(|| format!("opening {} for writing", request.device.display()))?;

    let mut meter = ProgressMeter::new(Stage::Flashing, total, throttle);
    emit(&ProgressMessage::from_sample(&meter.zero()));

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut written: u64 = 0;
    loop {
        if canceled.load(Ordering::SeqCst) {
            emit(&ProgressMessage::canceled_at(
                Stage::Flashing,
                written,
                percentage(written, total),
            ));
            return Ok(Outcome::Canceled);
        }
        let read = source.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        device.write_all(&buffer[..read]).with_context(|| {
            format!("writing to {} at offset {written}", request.device.display())
        })?;
        hasher.update(&buffer[..read]);
        written += read as u64;
        if let Some(sample) = meter.sample(written) {
            emit(&ProgressMessage::from_sample(&sample));
        }
    }
    device
        .sync_all()
        .with_context(|| format!("syncing {}", request.device.display()))?;
    emit(&ProgressMessage::from_sample(&meter.final_sample(written)));
    let expected = hasher.finalize();

    if request.verify {
        let mut device = File::open(&request.device)
            .with_context(|| format!("reopening {} for verification", request.device.display()))?;
        let mut meter = ProgressMeter::new(Stage::Verifying, written, throttle);
        emit(&ProgressMessage::from_sample(&meter.zero()));

        let mut hasher = Sha256::new();
        let mut verified: u64 = 0;
        while verified < written {
            if canceled.load(Ordering::SeqCst) {
                emit(&ProgressMessage::canceled_at(
                    Stage::Verifying,
                    verified,
                    percentage(verified, written),
                ));
                return Ok(Outcome::Canceled);
            }
            let want = CHUNK_SIZE.min((written - verified) as usize);
            let read = device.read(&mut buffer[..want])?;
            if read == 0 {
                bail!(
                    "{} ended after {verified} of {written} bytes",
                    request.device.display()
                );
            }
            hasher.update(&buffer[..read]);
            verified += read as u64;
            if let Some(sample) = meter.sample(verified) {
                emit(&ProgressMessage::from_sample(&sample));
            }
        }
        if hasher.finalize() != expected {
            bail!(
                "verification failed: {} does not match {}",
                request.device.display(),
                request.image.display()
            );
        }
        emit(&ProgressMessage::from_sample(&meter.final_sample(verified)));
    }

    emit(&ProgressMessage::from_sample(&ProgressSample::percent_only(
        Stage::Finished,
        100.0,
    )));
    Ok(Outcome::Completed)
}

#[cfg(unix)]
fn install_cancel_handler() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    extern "C" fn on_term(_: i32) {
        CANCELED.store(true, Ordering::SeqCst);
    }

    let action = SigAction::new(SigHandler::Handler(on_term), SaFlags::empty(), SigSet::empty());
    unsafe {
        let _ = sigaction(Signal::SIGTERM, &action);
        let _ = sigaction(Signal::SIGINT, &action);
    }
}

#[cfg(not(unix))]
fn install_cancel_handler() {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn request(scratch: &Path, payload: &[u8], verify: bool) -> FlashRequest {
        let image = scratch.join("image.img");
        fs::write(&image, payload).unwrap();
        FlashRequest {
            image,
            device: scratch.join("device.img"),
            verify,
        }
    }

    fn collect(
        request: &FlashRequest,
        canceled: &AtomicBool,
    ) -> (Result<Outcome>, Vec<ProgressMessage>) {
        let mut messages = Vec::new();
        let result = flash_and_verify(request, Duration::ZERO, canceled, &mut |msg| {
            messages.push(msg.clone())
        });
        (result, messages)
    }

    #[test]
    fn writes_verifies_and_reports_every_stage() {
        let scratch = tempfile::tempdir().unwrap();
        // Two full chunks plus a partial one.
        let payload = vec![7u8; CHUNK_SIZE * 2 + 512];
        let request = request(scratch.path(), &payload, true);

        let (result, messages) = collect(&request, &AtomicBool::new(false));
        assert!(matches!(result.unwrap(), Outcome::Completed));

        assert_eq!(fs::read(&request.device).unwrap(), payload);

        let stages: Vec<Stage> = messages.iter().map(|m| m.stage).collect();
        assert_eq!(stages.first(), Some(&Stage::Flashing));
        assert!(stages.contains(&Stage::Verifying));
        assert_eq!(stages.last(), Some(&Stage::Finished));
        assert!(messages.iter().all(|m| !m.canceled));

        let flash_done = messages
            .iter()
            .filter(|m| m.stage == Stage::Flashing)
            .last()
            .unwrap();
        assert_eq!(flash_done.percentage, 100.0);
        assert_eq!(flash_done.bytes_written, payload.len() as u64);
    }

    #[test]
    fn skips_verification_when_not_requested() {
        let scratch = tempfile::tempdir().unwrap();
        let request = request(scratch.path(), b"small image", false);

        let (result, messages) = collect(&request, &AtomicBool::new(false));
        assert!(matches!(result.unwrap(), Outcome::Completed));
        assert!(messages.iter().all(|m| m.stage != Stage::Verifying));
        assert_eq!(messages.last().unwrap().stage, Stage::Finished);
    }

    #[test]
    fn cancellation_emits_one_tagged_final_message() {
        let scratch = tempfile::tempdir().unwrap();
        let request = request(scratch.path(), &vec![1u8; CHUNK_SIZE * 4], true);

        let (result, messages) = collect(&request, &AtomicBool::new(true));
        assert!(matches!(result.unwrap(), Outcome::Canceled));

        let last = messages.last().unwrap();
        assert!(last.canceled);
        assert_eq!(last.stage, Stage::Flashing);
        // Nothing after the canceled message.
        assert_eq!(messages.iter().filter(|m| m.canceled).count(), 1);
        assert!(messages.iter().all(|m| m.stage != Stage::Finished));
    }

    #[test]
    fn missing_image_is_an_error_before_any_write() {
        let scratch = tempfile::tempdir().unwrap();
        let request = FlashRequest {
            image: PathBuf::from(scratch.path().join("absent.img")),
            device: scratch.path().join("device.img"),
            verify: true,
        };

        let (result, _) = collect(&request, &AtomicBool::new(false));
        assert!(result.is_err());
        assert!(!request.device.exists());
    }
}
