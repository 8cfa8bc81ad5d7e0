//! End-to-end orchestrator runs against the recording fake platform:
//! scripted worker children, real scratch filesystems, no elevation.

use imprint_core::catalog::{ImageDescriptor, OsVariant};
use imprint_core::{CredentialSession, ImprintConfig};
use imprint_platform::{
    Drive, FakeChildScript, FakePlatform, Mountpoint, Operation, ScriptedRun, Secret,
};
use imprint_workflow::{
    ConfigPayload, FlashJob, FlashState, ImageSource, JobEvent, Orchestrator,
};
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

const REPORT: &str = "\
-V 'Fleet OS'
-isohybrid-mbr --interval:local_fs:0s-15s:zero_mbrpt:'/images/fleet-installer.iso'
-partition_offset 0
";

struct Rig {
    fake: FakePlatform,
    orchestrator: Orchestrator,
    scratch: tempfile::TempDir,
}

impl Rig {
    fn new() -> Self {
        let fake = FakePlatform::new();
        fake.push_run_result("sudo", ScriptedRun::ok(""));
        let session = Arc::new(CredentialSession::new(Arc::new(fake.clone())));
        session.set_credential(Secret::new("pw")).unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let mut config = ImprintConfig::load_from(scratch.path()).unwrap();
        config.poll.mount_poll = Duration::from_millis(1);
        config.poll.copy_poll = Duration::from_millis(1);

        let orchestrator = Orchestrator::new(session, config);
        Self {
            fake,
            orchestrator,
            scratch,
        }
    }

    fn local_image(&self, name: &str) -> PathBuf {
        let path = self.scratch.path().join(name);
        fs::write(&path, vec![0u8; 4096]).unwrap();
        path
    }

    fn raw_job(&self, id: &str, name: &str) -> FlashJob {
        FlashJob {
            id: id.into(),
            source: ImageSource::LocalPath(self.local_image(name)),
            target_drive: drive("SanDisk Ultra", &[]),
            config_payload: None,
        }
    }
}

fn drive(description: &str, mounts: &[&str]) -> Drive {
    Drive {
        device_path: "/dev/sdz".into(),
        description: description.into(),
        bus_type: "USB".into(),
        is_removable: true,
        is_system: false,
        is_readonly: false,
        mountpoints: mounts.iter().map(|m| Mountpoint::new(*m)).collect(),
    }
}

fn worker_line(stage: &str, percentage: f64) -> String {
    format!(
        r#"{{"percentage":{percentage},"speed":4096.0,"averageSpeed":4000.0,"bytesWritten":8192,"type":"{stage}"}}"#
    )
}

fn canceled_line(stage: &str, percentage: f64) -> String {
    format!(
        r#"{{"percentage":{percentage},"speed":0.0,"averageSpeed":0.0,"bytesWritten":8192,"type":"{stage}","canceled":true}}"#
    )
}

fn drain_until_terminal(rx: &Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                let terminal =
                    matches!(&event, JobEvent::State { state, .. } if state.is_terminal());
                events.push(event);
                if terminal {
                    return events;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    panic!("job never reached a terminal state; saw {events:?}");
}

fn states(events: &[JobEvent]) -> Vec<FlashState> {
    events
        .iter()
        .filter_map(|e| match e {
            JobEvent::State { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

/// Block until the worker subprocess is demonstrably live (its first
/// progress tick arrived), collecting the events seen on the way.
fn wait_for_first_progress(rx: &Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                let progress = matches!(&event, JobEvent::Progress { .. });
                events.push(event);
                if progress {
                    return events;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    panic!("worker never reported progress; saw {events:?}");
}

#[test]
fn raw_image_flows_straight_to_finished() {
    let rig = Rig::new();
    rig.fake.push_spawn_script(
        "sudo",
        FakeChildScript::emitting([
            worker_line("flashing", 25.0),
            worker_line("flashing", 80.0),
            worker_line("verifying", 40.0),
            worker_line("finished", 100.0),
        ]),
    );

    let (tx, rx) = mpsc::channel();
    rig.orchestrator
        .start_flash(rig.raw_job("job-raw", "fleet-os.img"), tx)
        .unwrap();

    let events = drain_until_terminal(&rx);
    assert_eq!(
        states(&events),
        vec![
            FlashState::Starting,
            FlashState::Flashing,
            FlashState::Verifying,
            FlashState::Finished,
        ]
    );
    assert!(events.iter().any(
        |e| matches!(e, JobEvent::Progress { sample, .. } if sample.percentage == 80.0)
    ));

    // The worker ran elevated with the hidden subcommand.
    let spawned = rig
        .fake
        .operations()
        .iter()
        .find_map(|op| match op {
            Operation::Spawn { program, args, .. } if program == "sudo" => Some(args.clone()),
            _ => None,
        })
        .expect("worker spawned");
    assert!(spawned.contains(&"flash-worker".to_string()));

    assert!(rig.orchestrator.remove_job("job-raw"));
    assert!(!rig.orchestrator.remove_job("job-raw"));
}

#[test]
fn installer_rebuilds_the_iso_and_deploys_the_config() {
    let rig = Rig::new();

    // Tree behind the fake ISO mount.
    let template = rig.scratch.path().join("template");
    fs::create_dir_all(template.join("isolinux")).unwrap();
    fs::write(template.join("isolinux/isolinux.bin"), vec![0u8; 512]).unwrap();
    rig.fake.set_iso_template(&template);

    // The installer is already in the image cache, so no download runs.
    let descriptor = ImageDescriptor {
        download_url: "https://downloads.example/fleet-installer.iso.gz".into(),
        file_name: "fleet-installer.iso.gz".into(),
        sha256: None,
        size_bytes: 4096,
        os_variant: OsVariant::Installer,
    };
    fs::write(rig.scratch.path().join("fleet-installer.iso"), b"iso").unwrap();

    rig.fake.push_run_result("xorriso", ScriptedRun::ok(REPORT));
    rig.fake.push_spawn_script(
        "xorriso",
        FakeChildScript::emitting(["xorriso : UPDATE :  55.00% done"]),
    );
    rig.fake.push_spawn_script(
        "sudo",
        FakeChildScript::emitting([
            worker_line("flashing", 50.0),
            worker_line("verifying", 90.0),
        ]),
    );

    // The freshly flashed stick comes back mounted.
    let media = rig.scratch.path().join("media");
    fs::create_dir_all(&media).unwrap();
    rig.fake.push_drive_listing(vec![drive(
        "SanDisk Ultra",
        &[media.to_str().unwrap()],
    )]);

    let (tx, rx) = mpsc::channel();
    rig.orchestrator
        .start_flash(
            FlashJob {
                id: "job-iso".into(),
                source: ImageSource::Catalog(descriptor),
                target_drive: drive("SanDisk Ultra", &[]),
                config_payload: Some(ConfigPayload {
                    file_name: "device.devconf".into(),
                    content: serde_json::json!({"ssid": "lab"}),
                }),
            },
            tx,
        )
        .unwrap();

    let events = drain_until_terminal(&rx);
    assert_eq!(
        states(&events),
        vec![
            FlashState::Starting,
            FlashState::ExtractingIso,
            FlashState::RecreatingIso,
            FlashState::Flashing,
            FlashState::Verifying,
            FlashState::Configuring,
            FlashState::Finished,
        ]
    );

    // Deployed under both the legacy and the current name, intact.
    assert!(media.join("device.fleet").exists());
    let deployed: serde_json::Value =
        serde_json::from_slice(&fs::read(media.join("device.devconf")).unwrap()).unwrap();
    assert_eq!(deployed["ssid"], "lab");

    // The per-job rebuilt ISO is gone once the job is done.
    assert!(!rig
        .scratch
        .path()
        .join("fleet-installer-job-iso.iso")
        .exists());

    rig.orchestrator.remove_job("job-iso");
}

#[test]
fn cancel_lands_in_the_canceled_substate() {
    let rig = Rig::new();
    rig.fake.push_spawn_script(
        "sudo",
        FakeChildScript::emitting([worker_line("flashing", 10.0)])
            .hold_until_terminate([canceled_line("flashing", 10.0)], 1),
    );

    let (tx, rx) = mpsc::channel();
    rig.orchestrator
        .start_flash(rig.raw_job("job-cancel", "fleet-os.img"), tx)
        .unwrap();

    let mut events = wait_for_first_progress(&rx);
    rig.orchestrator.cancel_flash("job-cancel");
    events.extend(drain_until_terminal(&rx));

    let seen = states(&events);
    assert_eq!(seen.last(), Some(&FlashState::FlashingCanceled));
    assert!(!seen.contains(&FlashState::Finished));
    assert!(!seen.contains(&FlashState::Failed));
    assert!(!seen.contains(&FlashState::Idle));
    assert_eq!(
        rig.orchestrator.job_status("job-cancel").unwrap().state,
        FlashState::FlashingCanceled
    );

    rig.orchestrator.remove_job("job-cancel");
}

#[test]
fn cancel_is_harmless_without_a_live_subprocess() {
    let rig = Rig::new();
    rig.fake.push_spawn_script(
        "sudo",
        FakeChildScript::emitting([worker_line("flashing", 10.0)])
            .hold_until_terminate([canceled_line("flashing", 10.0)], 1),
    );

    // Unknown id: nothing to signal, nothing to track.
    rig.orchestrator.cancel_flash("no-such-job");
    assert!(rig.orchestrator.active_ids().is_empty());

    let (tx, rx) = mpsc::channel();
    rig.orchestrator
        .start_flash(rig.raw_job("job-recancel", "fleet-os.img"), tx)
        .unwrap();
    wait_for_first_progress(&rx);
    rig.orchestrator.cancel_flash("job-recancel");
    drain_until_terminal(&rx);

    // The worker is gone and its controller slot is cleared; a second
    // cancel hits the empty slot and stays a no-op.
    rig.orchestrator.cancel_flash("job-recancel");
    assert_eq!(
        rig.orchestrator.job_status("job-recancel").unwrap().state,
        FlashState::FlashingCanceled
    );

    rig.orchestrator.remove_job("job-recancel");
}

#[test]
fn duplicate_job_ids_are_rejected_while_running() {
    let rig = Rig::new();
    rig.fake.push_spawn_script(
        "sudo",
        FakeChildScript::emitting([worker_line("flashing", 5.0)])
            .hold_until_terminate([canceled_line("flashing", 5.0)], 1),
    );

    let (tx, rx) = mpsc::channel();
    rig.orchestrator
        .start_flash(rig.raw_job("job-dup", "a.img"), tx)
        .unwrap();
    wait_for_first_progress(&rx);

    let (tx2, _rx2) = mpsc::channel();
    let err = rig
        .orchestrator
        .start_flash(rig.raw_job("job-dup", "b.img"), tx2)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<imprint_core::ImprintError>(),
        Some(imprint_core::ImprintError::AlreadyRunning(id)) if id == "job-dup"
    ));

    rig.orchestrator.cancel_flash("job-dup");
    drain_until_terminal(&rx);
    assert!(rig.orchestrator.remove_job("job-dup"));
}

#[test]
fn worker_failure_surfaces_as_a_failed_event() {
    let rig = Rig::new();
    rig.fake.push_spawn_script(
        "sudo",
        FakeChildScript::emitting([worker_line("flashing", 10.0)]).exit_code(4),
    );

    let (tx, rx) = mpsc::channel();
    rig.orchestrator
        .start_flash(rig.raw_job("job-bad", "fleet-os.img"), tx)
        .unwrap();

    let events = drain_until_terminal(&rx);
    assert_eq!(states(&events).last(), Some(&FlashState::Failed));
    let message = events
        .iter()
        .find_map(|e| match e {
            JobEvent::Failed { message, .. } => Some(message.clone()),
            _ => None,
        })
        .expect("failure event");
    assert!(message.contains("flash-worker"));

    rig.orchestrator.remove_job("job-bad");
}

#[test]
fn start_validates_before_spawning_anything() {
    let rig = Rig::new();

    let (tx, _rx) = mpsc::channel();
    let mut no_target = rig.raw_job("job-v1", "ok.img");
    no_target.target_drive.device_path = String::new();
    assert!(rig.orchestrator.start_flash(no_target, tx).is_err());

    let (tx, _rx) = mpsc::channel();
    let missing_source = FlashJob {
        id: "job-v2".into(),
        source: ImageSource::LocalPath(rig.scratch.path().join("nope.img")),
        target_drive: drive("SanDisk Ultra", &[]),
        config_payload: None,
    };
    assert!(rig.orchestrator.start_flash(missing_source, tx).is_err());

    // Nothing ran and nothing is tracked.
    assert!(rig.orchestrator.active_ids().is_empty());
    assert!(!rig
        .fake
        .operations()
        .iter()
        .any(|op| matches!(op, Operation::Spawn { .. })));
}
