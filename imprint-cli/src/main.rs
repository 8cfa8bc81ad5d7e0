//! `imprint` command-line interface.
//!
//! Everything interactive prints to stderr so stdout stays scriptable;
//! the hidden `flash-worker` subcommand is the elevated worker half of
//! the flash pipeline and speaks protocol JSON on stdout instead.

mod worker;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use imprint_core::iso::IsoJob;
use imprint_core::{acquire, catalog, inventory, logging, CredentialSession, ImprintConfig};
use imprint_core::progress::ProgressSample;
use imprint_platform::{detect, Platform, Secret};
use imprint_workflow::{ConfigPayload, FlashJob, FlashState, ImageSource, JobEvent, Orchestrator};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

const SUDO_PASSWORD_ENV: &str = "IMPRINT_SUDO_PASSWORD";

#[derive(Debug, Parser)]
#[command(name = "imprint", version)]
#[command(about = "Provision removable media with fleet images")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List drives eligible as flash targets
    Drives,
    /// Show the partition table of a device
    Partitions { device: String },
    /// List the images the catalog offers
    Images,
    /// Download a catalog image into the local cache
    Fetch { name: String },
    /// Rebuild an installer ISO, optionally injecting a config file
    Rebuild {
        iso: PathBuf,
        /// Configuration file written into the ISO root
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Flash an image onto a drive
    Flash {
        image: PathBuf,
        /// Target device path, e.g. /dev/sdb
        device: String,
        /// Configuration file copied onto the target after flashing
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Unmount every partition of a drive so it can be unplugged
    Eject { device: String },
    /// Elevated worker entry point, spawned by the flash pipeline
    #[command(name = "flash-worker", hide = true)]
    FlashWorker { request: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::FlashWorker { request } = &cli.command {
        logging::init_stderr();
        std::process::exit(worker::run(request));
    }

    let config = ImprintConfig::load()?;
    logging::init(&config.log_file());
    let platform = detect()?;

    match cli.command {
        Commands::Drives => drives(&platform),
        Commands::Partitions { device } => partitions(platform, &device),
        Commands::Images => images(&config),
        Commands::Fetch { name } => fetch(&config, &name),
        Commands::Rebuild { iso, config: payload } => {
            rebuild(platform, &config, &iso, payload.as_deref())
        }
        Commands::Flash {
            image,
            device,
            config: payload,
        } => flash(platform, &config, image, &device, payload.as_deref()),
        Commands::Eject { device } => eject(platform, &device),
        Commands::FlashWorker { .. } => unreachable!("handled above"),
    }
}

/// Build a credential session, taking the secret from the environment
/// or prompting for it. Already-elevated processes need neither.
fn authorize(platform: Arc<dyn Platform>) -> Result<CredentialSession> {
    let session = CredentialSession::new(platform);
    if session.platform().already_elevated() {
        return Ok(session);
    }
    let secret = match std::env::var(SUDO_PASSWORD_ENV) {
        Ok(value) if !value.is_empty() => Secret::new(value),
        _ => prompt_secret()?,
    };
    session.set_credential(secret)?;
    Ok(session)
}

fn prompt_secret() -> Result<Secret> {
    eprint!("administrator password: ");
    let _ = io::stderr().flush();
    let mut line = String::new();
    io::stdin()
        .read_line(&mut line)
        .context("reading password")?;
    Ok(Secret::new(line.trim_end_matches(['\r', '\n'])))
}

fn print_progress(sample: &ProgressSample) {
    eprint!("\r{}: {:5.1}%   ", sample.stage, sample.percentage);
    let _ = io::stderr().flush();
}

fn drives(platform: &Arc<dyn Platform>) -> Result<()> {
    let drives = inventory::list_drives(platform)?;
    if drives.is_empty() {
        eprintln!("no eligible drives");
        return Ok(());
    }
    for drive in drives {
        let mounts: Vec<&str> = drive.mountpoints.iter().map(|m| m.path.as_str()).collect();
        println!(
            "{}\t{}\t{}\t{}",
            drive.device_path,
            drive.description,
            drive.bus_type,
            mounts.join(",")
        );
    }
    Ok(())
}

fn partitions(platform: Arc<dyn Platform>, device: &str) -> Result<()> {
    let session = authorize(platform)?;
    for partition in inventory::partitions(&session, device)? {
        println!(
            "{}\t{}\t{}{}",
            partition.device,
            partition.size,
            partition.type_name,
            if partition.boot { "\t(boot)" } else { "" }
        );
    }
    Ok(())
}

fn images(config: &ImprintConfig) -> Result<()> {
    for descriptor in catalog::fetch_catalog(config)? {
        let kind = if descriptor.os_variant.is_installer() {
            "installer"
        } else {
            "raw"
        };
        let cached = catalog::cached_image(config, &descriptor)?.is_some();
        println!(
            "{}\t{}\t{} bytes{}",
            descriptor.file_name,
            kind,
            descriptor.size_bytes,
            if cached { "\t(cached)" } else { "" }
        );
    }
    Ok(())
}

fn fetch(config: &ImprintConfig, name: &str) -> Result<()> {
    let catalog = catalog::fetch_catalog(config)?;
    let descriptor = catalog::find(&catalog, name)
        .with_context(|| format!("{name} is not in the image catalog"))?;

    if let Some(path) = catalog::cached_image(config, descriptor)? {
        println!("{}", path.display());
        return Ok(());
    }

    let throttle = config.poll.progress_throttle;
    let mut emit = |sample: &ProgressSample| print_progress(sample);
    let compressed = catalog::compressed_path(config, descriptor);
    acquire::download_image(descriptor, &compressed, throttle, &mut emit)?;
    eprintln!();
    let image = acquire::decompress_gz(&compressed, descriptor.size_bytes, throttle, &mut emit)?;
    eprintln!();
    let _ = fs::remove_file(&compressed);

    println!("{}", image.display());
    Ok(())
}

fn rebuild(
    platform: Arc<dyn Platform>,
    config: &ImprintConfig,
    iso: &Path,
    payload: Option<&Path>,
) -> Result<()> {
    let session = authorize(platform)?;
    let job_id = format!("cli-{}", std::process::id());
    let mut job = IsoJob::new(&session, config, job_id.as_str());

    let (tx, rx) = mpsc::channel::<ProgressSample>();
    let printer = thread::spawn(move || {
        for sample in rx {
            print_progress(&sample);
        }
        eprintln!();
    });

    let result = (|| -> Result<PathBuf> {
        job.extract_contents(iso, &tx)?;
        if let Some(path) = payload {
            let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            job.write_file(payload_name(path)?, &data)?;
        }
        job.rebuild(iso, &tx)
    })();
    drop(tx);
    let _ = printer.join();

    job.cleanup(None);
    let new_iso = result?;
    println!("{}", new_iso.display());
    Ok(())
}

fn flash(
    platform: Arc<dyn Platform>,
    config: &ImprintConfig,
    image: PathBuf,
    device: &str,
    payload: Option<&Path>,
) -> Result<()> {
    let session = Arc::new(authorize(platform)?);
    let target = inventory::list_drives(session.platform())?
        .into_iter()
        .find(|d| d.device_path == device)
        .with_context(|| format!("{device} is not an eligible flash target"))?;
    inventory::unmount_disk(&session, device)?;

    let config_payload = payload.map(read_payload).transpose()?;
    let orchestrator = Orchestrator::new(Arc::clone(&session), config.clone());
    let job_id = format!("cli-{}", std::process::id());
    let (tx, rx) = mpsc::channel();
    orchestrator.start_flash(
        FlashJob {
            id: job_id.clone(),
            source: ImageSource::LocalPath(image),
            target_drive: target,
            config_payload,
        },
        tx,
    )?;

    let mut failure = None;
    let mut terminal = FlashState::Idle;
    for event in rx {
        match event {
            JobEvent::State { state, .. } => {
                eprintln!("{state}");
                if state.is_terminal() {
                    terminal = state;
                    break;
                }
            }
            JobEvent::Progress { sample, .. } => print_progress(&sample),
            JobEvent::Failed { message, .. } => failure = Some(message),
        }
    }
    orchestrator.remove_job(&job_id);

    if let Some(message) = failure {
        bail!(message);
    }
    if terminal != FlashState::Finished {
        bail!("flash ended in state {terminal}");
    }
    Ok(())
}

fn eject(platform: Arc<dyn Platform>, device: &str) -> Result<()> {
    let session = authorize(platform)?;
    inventory::unmount_disk(&session, device)?;
    eprintln!("{device} can be unplugged");
    Ok(())
}

fn payload_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))
}

fn read_payload(path: &Path) -> Result<ConfigPayload> {
    let file_name = payload_name(path)?.to_string();
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let content = serde_json::from_str(&text)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    Ok(ConfigPayload { file_name, content })
}
