//! The flash orchestrator: sequences acquisition, ISO rebuild, the
//! elevated flash worker, and post-flash configuration deployment for
//! any number of concurrent jobs.
//!
//! Each job runs on its own thread and reports through its event
//! channel; jobs are independent and share nothing but the credential
//! session. Cancellation is cooperative: the worker gets a termination
//! signal, reports its last stage as canceled, and exits non-zero; only
//! application shutdown force-kills.

use crate::job::{ConfigPayload, FlashJob, FlashState, ImageSource, JobEvent};
use anyhow::{bail, Context};
use imprint_core::broker::CredentialSession;
use imprint_core::config::ImprintConfig;
use imprint_core::errors::{ImprintError, Result};
use imprint_core::iso::{scratch, IsoJob, ScratchPaths};
use imprint_core::progress::{ProgressSample, Stage};
use imprint_core::worker::{self, FlashRequest, RequestFile};
use imprint_core::{acquire, catalog, inventory};
use imprint_platform::ProcessController;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Last observed position of a job, for callers that join late.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub state: FlashState,
    pub last_sample: Option<ProgressSample>,
}

struct JobHandle {
    cancel: Arc<AtomicBool>,
    controller: Arc<Mutex<Option<Arc<dyn ProcessController>>>>,
    status: Arc<Mutex<JobStatus>>,
    thread: Option<JoinHandle<()>>,
}

pub struct Orchestrator {
    session: Arc<CredentialSession>,
    config: ImprintConfig,
    jobs: Mutex<HashMap<String, JobHandle>>,
}

impl Orchestrator {
    pub fn new(session: Arc<CredentialSession>, config: ImprintConfig) -> Self {
        Self {
            session,
            config,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn session(&self) -> &Arc<CredentialSession> {
        &self.session
    }

    /// Start a flash job on its own thread.
    ///
    /// Validation failures (missing target, missing source, duplicate
    /// live id) surface here, before anything runs; everything after
    /// that arrives on the event channel.
    pub fn start_flash(&self, job: FlashJob, events: Sender<JobEvent>) -> Result<()> {
        if job.target_drive.device_path.is_empty() {
            bail!("flash job {} has no target drive", job.id);
        }
        if let ImageSource::LocalPath(path) = &job.source {
            if !path.exists() {
                bail!("source image {} does not exist", path.display());
            }
        }

        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(ImprintError::AlreadyRunning(job.id.clone()).into());
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let controller: Arc<Mutex<Option<Arc<dyn ProcessController>>>> =
            Arc::new(Mutex::new(None));
        let status = Arc::new(Mutex::new(JobStatus {
            state: FlashState::Idle,
            last_sample: None,
        }));

        let id = job.id.clone();
        info!("starting flash job {id} onto {}", job.target_drive.device_path);
        let run = JobRun {
            session: Arc::clone(&self.session),
            config: self.config.clone(),
            job,
            events,
            cancel: Arc::clone(&cancel),
            controller: Arc::clone(&controller),
            status: Arc::clone(&status),
        };
        let thread = thread::spawn(move || {
            if let Err(err) = run.run() {
                error!("flash job {} failed: {err:#}", run.job.id);
                let _ = run.events.send(JobEvent::Failed {
                    id: run.job.id.clone(),
                    message: format!("{err:#}"),
                });
                run.set_state(FlashState::Failed);
            }
        });

        jobs.insert(
            id,
            JobHandle {
                cancel,
                controller,
                status,
                thread: Some(thread),
            },
        );
        Ok(())
    }

    /// Ask a job's live subprocess to stop. No subprocess, no effect;
    /// cancellation is never an error.
    pub fn cancel_flash(&self, id: &str) {
        let jobs = self.jobs.lock().unwrap();
        let Some(handle) = jobs.get(id) else {
            debug!("cancel for unknown job {id}");
            return;
        };
        handle.cancel.store(true, Ordering::SeqCst);
        // Clone the controller out so the slot lock is released before
        // signaling.
        let controller = handle.controller.lock().unwrap().clone();
        match controller {
            Some(controller) => {
                info!("canceling job {id}");
                controller.terminate();
            }
            None => debug!("job {id} has no live subprocess to signal"),
        }
    }

    pub fn job_status(&self, id: &str) -> Option<JobStatus> {
        self.jobs
            .lock()
            .unwrap()
            .get(id)
            .map(|h| h.status.lock().unwrap().clone())
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.jobs.lock().unwrap().keys().cloned().collect()
    }

    /// Drop a job from the active list, joining its thread. Callers do
    /// this after observing a terminal event; removing a running job
    /// blocks until it finishes.
    pub fn remove_job(&self, id: &str) -> bool {
        let handle = self.jobs.lock().unwrap().remove(id);
        match handle {
            Some(mut handle) => {
                if let Some(thread) = handle.thread.take() {
                    let _ = thread.join();
                }
                true
            }
            None => false,
        }
    }

    /// Force-terminate every tracked subprocess. Application shutdown
    /// only.
    pub fn shutdown(&self) {
        self.session.shutdown();
    }
}

enum FlashOutcome {
    Completed,
    Canceled(FlashState),
}

/// Everything one job thread owns.
struct JobRun {
    session: Arc<CredentialSession>,
    config: ImprintConfig,
    job: FlashJob,
    events: Sender<JobEvent>,
    cancel: Arc<AtomicBool>,
    controller: Arc<Mutex<Option<Arc<dyn ProcessController>>>>,
    status: Arc<Mutex<JobStatus>>,
}

impl JobRun {
    fn run(&self) -> Result<()> {
        self.set_state(FlashState::Starting);

        // Late-bound fields (network credentials) are persisted before
        // anything else so both the ISO injection and the post-flash
        // copy see the same file.
        let staged = match &self.job.config_payload {
            Some(payload) => Some(self.persist_config(payload)?),
            None => None,
        };

        let (image, installer) = self.resolve_image()?;
        let (flash_image, rebuilt) = if installer {
            let new_iso = self.rebuild_installer(&image)?;
            (new_iso.clone(), Some(new_iso))
        } else {
            (image, None)
        };

        let outcome = self.flash(&flash_image);
        if rebuilt.is_some() {
            scratch::cleanup(&ScratchPaths::for_job(&self.job.id), rebuilt.as_deref());
        }
        if let FlashOutcome::Canceled(state) = outcome? {
            self.set_state(state);
            return Ok(());
        }

        if let (Some(payload), Some(staged)) = (&self.job.config_payload, &staged) {
            self.set_state(FlashState::Configuring);
            self.deploy_config(payload, staged)?;
        }

        self.set_state(FlashState::Finished);
        info!("flash job {} finished", self.job.id);
        Ok(())
    }

    fn set_state(&self, state: FlashState) {
        self.status.lock().unwrap().state = state;
        let _ = self.events.send(JobEvent::State {
            id: self.job.id.clone(),
            state,
        });
    }

    fn send_sample(&self, sample: ProgressSample) {
        self.status.lock().unwrap().last_sample = Some(sample);
        let _ = self.events.send(JobEvent::Progress {
            id: self.job.id.clone(),
            sample,
        });
    }

    /// Bridge for the threaded ISO engine: samples in, job events out.
    fn forwarder(&self) -> (mpsc::Sender<ProgressSample>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel();
        let events = self.events.clone();
        let status = Arc::clone(&self.status);
        let id = self.job.id.clone();
        let handle = thread::spawn(move || {
            for sample in rx {
                status.lock().unwrap().last_sample = Some(sample);
                let _ = events.send(JobEvent::Progress {
                    id: id.clone(),
                    sample,
                });
            }
        });
        (tx, handle)
    }

    fn persist_config(&self, payload: &ConfigPayload) -> Result<PathBuf> {
        let path = self.config.config_dir.join(&payload.file_name);
        fs::write(&path, payload.to_bytes()?)
            .with_context(|| format!("staging configuration {}", path.display()))?;
        Ok(path)
    }

    /// Resolve the concrete image to flash: a path the caller gave us,
    /// a verified cache hit, or a fresh download plus decompression.
    fn resolve_image(&self) -> Result<(PathBuf, bool)> {
        let throttle = self.config.poll.progress_throttle;
        match &self.job.source {
            ImageSource::LocalPath(path) => {
                let installer = path
                    .extension()
                    .is_some_and(|e| e.eq_ignore_ascii_case("iso"));
                Ok((path.clone(), installer))
            }
            ImageSource::Catalog(descriptor) => {
                let installer = descriptor.os_variant.is_installer();
                if let Some(path) = catalog::cached_image(&self.config, descriptor)? {
                    return Ok((path, installer));
                }
                self.set_state(FlashState::Downloading);
                let compressed = catalog::compressed_path(&self.config, descriptor);
                acquire::download_image(descriptor, &compressed, throttle, &mut |s| {
                    self.send_sample(*s)
                })?;
                self.set_state(FlashState::Decompressing);
                let image = acquire::decompress_gz(
                    &compressed,
                    descriptor.size_bytes,
                    throttle,
                    &mut |s| self.send_sample(*s),
                )?;
                // The decompressed artifact supersedes the archive.
                let _ = fs::remove_file(&compressed);
                Ok((image, installer))
            }
        }
    }

    /// Installer variants: extract, inject the configuration, remaster.
    fn rebuild_installer(&self, image: &Path) -> Result<PathBuf> {
        self.set_state(FlashState::ExtractingIso);
        let mut iso = IsoJob::new(&self.session, &self.config, self.job.id.as_str());
        let result = (|| -> Result<PathBuf> {
            let (tx, fwd) = self.forwarder();
            let extracted = iso.extract_contents(image, &tx);
            drop(tx);
            let _ = fwd.join();
            extracted?;

            if let Some(payload) = &self.job.config_payload {
                iso.write_file(&payload.file_name, &payload.to_bytes()?)?;
            }

            self.set_state(FlashState::RecreatingIso);
            let (tx, fwd) = self.forwarder();
            let rebuilt = iso.rebuild(image, &tx);
            drop(tx);
            let _ = fwd.join();
            rebuilt
        })();

        match result {
            Ok(new_iso) => {
                // Fire-and-forget: the rebuilt path is already usable.
                if let Err(err) = iso.detach() {
                    warn!("detaching original ISO for job {}: {err:#}", self.job.id);
                }
                Ok(new_iso)
            }
            Err(err) => {
                iso.cleanup(None);
                Err(err)
            }
        }
    }

    /// Run the elevated worker and relay its progress stream.
    fn flash(&self, image: &Path) -> Result<FlashOutcome> {
        self.set_state(FlashState::Flashing);
        let request = FlashRequest {
            image: image.to_path_buf(),
            device: PathBuf::from(&self.job.target_drive.device_path),
            verify: true,
        };
        let request_file = RequestFile::create(&request)?;
        let spec = worker::worker_spec(request_file.path())?;

        let mut child = self.session.spawn_elevated(spec)?;
        *self.controller.lock().unwrap() = Some(child.controller());

        let mut last_stage = FlashState::Flashing;
        let mut reached_verify = false;
        let mut saw_canceled = false;
        let exit = child.stream(&mut |line| {
            let Some(msg) = worker::parse_progress_line(line.text()) else {
                debug!("worker[{}]: {}", self.job.id, line.text());
                return true;
            };
            if msg.canceled {
                saw_canceled = true;
            }
            match msg.stage {
                Stage::Flashing => last_stage = FlashState::Flashing,
                Stage::Verifying => {
                    if !reached_verify {
                        reached_verify = true;
                        self.set_state(FlashState::Verifying);
                    }
                    last_stage = FlashState::Verifying;
                }
                _ => {}
            }
            self.send_sample(msg.to_sample());
            true
        });
        *self.controller.lock().unwrap() = None;
        let exit = exit.context("streaming flash worker")?;

        if exit.success() {
            return Ok(FlashOutcome::Completed);
        }
        if saw_canceled || self.cancel.load(Ordering::SeqCst) {
            info!("job {} canceled during {last_stage}", self.job.id);
            return Ok(FlashOutcome::Canceled(last_stage.canceled()));
        }
        Err(ImprintError::SubprocessNonZeroExit {
            program: worker::WORKER_SUBCOMMAND.to_string(),
            code: exit.code,
        }
        .into())
    }

    /// Copy the staged configuration onto the re-mounted target.
    fn deploy_config(&self, payload: &ConfigPayload, staged: &Path) -> Result<()> {
        // Best-effort: kick the partitions mounted where the volume
        // manager will not; the poll below is the actual gate.
        if let Err(err) = inventory::automount(&self.session, &self.job.target_drive.device_path)
        {
            debug!("automount before config deploy: {err:#}");
        }
        let drive = inventory::wait_for_mount(
            self.session.platform(),
            &self.config.poll,
            &self.job.target_drive.description,
        )?;
        let mount = drive
            .mountpoints
            .first()
            .ok_or_else(|| ImprintError::MountNotFound(drive.device_path.clone()))?;

        let dest = Path::new(&mount.path).join(&payload.file_name);
        let mut copied = fs::copy(staged, &dest);
        if copied.is_err() && cfg!(windows) {
            // Drive-letter assignment can lag the first poll right
            // after a flash; one more interval covers it.
            thread::sleep(self.config.poll.mount_poll);
            copied = fs::copy(staged, &dest);
        }
        copied.with_context(|| format!("copying configuration to {}", dest.display()))?;
        info!("deployed {} to {}", payload.file_name, mount.path);

        if let Some(companion) = payload.companion_name() {
            match fs::copy(staged, Path::new(&mount.path).join(&companion)) {
                Ok(_) => debug!("duplicated configuration as {companion}"),
                Err(err) => warn!("could not duplicate configuration as {companion}: {err}"),
            }
        }
        Ok(())
    }
}
