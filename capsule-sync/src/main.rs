//! capsule-sync - Sound Capsules sync client
//!
//! Command-line front end for the sync core: inspect asset status, open
//! capsules through the JIT gate, drive downloads and uploads, and run the
//! boot-time reconciliation. Notices from the event bus go to stderr;
//! command results go to stdout.

use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use capsule_common::api::{AssetStatus, Capsule, CapsuleId, CloudStatus, DownloadState};
use capsule_common::config::{load_toml_config, write_toml_config, ConfigResolver, TomlConfig};
use capsule_common::events::{CapsuleEvent, EventBus};
use capsule_common::format::{format_eta, format_size, format_speed};
use capsule_sync::auth::Credentials;
use capsule_sync::boot::BootOutcome;
use capsule_sync::jit::{ActionLabel, DecisionPrompt, FixedPrompt, JitChoice, JitOutcome};
use capsule_sync::upload::UploadOutcome;
use capsule_sync::SyncCore;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for capsule-sync
#[derive(Parser, Debug)]
#[command(name = "capsule-sync")]
#[command(about = "Sound Capsules sync client")]
#[command(version)]
struct Args {
    /// Config file (default: ~/.config/capsule-sync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Remote service base URL
    #[arg(long, global = true, env = "CAPSULE_API_BASE_URL")]
    api_base_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show a capsule's asset status
    Status { id: CapsuleId },
    /// Open a capsule, downloading its assets first if needed
    Open {
        id: CapsuleId,
        /// Open with the files already present
        #[arg(long, conflicts_with = "download")]
        offline: bool,
        /// Download missing assets, then open
        #[arg(long)]
        download: bool,
    },
    /// Download a capsule's assets and follow progress (Ctrl+C cancels)
    Download { id: CapsuleId },
    /// Pause a running download
    Pause { id: CapsuleId },
    /// Resume a paused download
    Resume { id: CapsuleId },
    /// Cancel a download
    Cancel { id: CapsuleId },
    /// Upload capsules (metadata and previews)
    Upload {
        #[arg(required = true)]
        ids: Vec<CapsuleId>,
    },
    /// Upload an already-synced capsule again
    Reupload { id: CapsuleId },
    /// Pull newer cloud data
    Pull,
    /// Run the download-only startup sync (Ctrl+C skips once allowed)
    BootSync,
    /// Show the remote sync overview
    SyncStatus,
    /// Sync tags/keywords in both directions
    SyncTags,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let resolver = ConfigResolver::new().with_cli_path(args.config.clone());
    let mut config = resolver.resolve().context("Failed to load configuration")?;
    if let Some(url) = &args.api_base_url {
        config.api_base_url = url.clone();
    }

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&level, config.logging.file.as_deref())?;

    match resolver.config_path() {
        Some(path) if path.exists() => info!("Configuration: {}", path.display()),
        Some(path) => warn!("Config file not found at {}, using defaults", path.display()),
        None => warn!("Could not determine config directory, using defaults"),
    }
    info!("Remote service: {}", config.api_base_url);

    let initial_credentials = Credentials::new(
        config.auth.access_token.clone(),
        config.auth.refresh_token.clone(),
    );
    let core = SyncCore::from_config(config.clone()).context("Failed to initialize sync core")?;
    let stop_printer = CancellationToken::new();
    let printer = spawn_notice_printer(&core.bus, stop_printer.clone());

    let result = run(&core, args.command).await;

    core.shutdown().await;
    stop_printer.cancel();
    let _ = printer.await;

    if let Some(tokens) = &core.tokens {
        let current = tokens.snapshot().await;
        if current != initial_credentials {
            persist_credentials(&resolver, current);
        }
    }

    result
}

async fn run(core: &SyncCore, command: Command) -> Result<()> {
    match command {
        Command::Status { id } => {
            let report = core.resolver.get_status(id).await;
            println!("capsule:        {}", report.capsule_id);
            println!("asset status:   {}", report.asset_status);
            println!("cloud status:   {}", report.cloud_status.as_str());
            println!("download:       {:.0}%", report.download_progress);
            if let Some(size) = report.local_wav_size {
                println!("local audio:    {}", format_size(size));
            }
            println!("pinned:         {}", report.is_cache_pinned);
            println!(
                "action:         {}",
                ActionLabel::for_status(report.asset_status).text()
            );
        }
        Command::Open {
            id,
            offline,
            download,
        } => {
            let capsule = capsule_stub(id);
            let gate = core.jit_gate();
            let outcome = if offline {
                gate.open(&capsule, &FixedPrompt(JitChoice::OpenOffline)).await
            } else if download {
                gate.open(&capsule, &FixedPrompt(JitChoice::DownloadThenOpen))
                    .await
            } else {
                gate.open(&capsule, &StdinPrompt).await
            };
            match outcome.context("Open failed")? {
                JitOutcome::Opened { offline: true } => println!("Opened capsule {} (offline)", id),
                JitOutcome::Opened { offline: false } => println!("Opened capsule {}", id),
                JitOutcome::AlreadyDownloading => println!("Capsule {} is still downloading", id),
                JitOutcome::Dismissed => println!("Cancelled"),
                JitOutcome::DownloadFailed { state, message } => {
                    anyhow::bail!("Download {}: {}", state, message)
                }
            }
        }
        Command::Download { id } => {
            let mut handle = core
                .downloads
                .start_download(id)
                .await
                .context("Failed to start download")?;
            let mut task = handle.latest();
            let mut interrupted = false;
            while !task.state.is_terminal() {
                tokio::select! {
                    next = handle.changed() => match next {
                        Some(update) => task = update,
                        None => break,
                    },
                    _ = signal::ctrl_c() => {
                        interrupted = true;
                        break;
                    }
                }
            }
            if !task.state.is_terminal() {
                task = handle.latest();
            }
            if interrupted {
                info!("Received Ctrl+C, cancelling download");
                core.downloads.cancel(id).await.context("Cancel failed")?;
                task.state = DownloadState::Cancelled;
            }
            println!("Download {}: {}", id, task.state);
        }
        Command::Pause { id } => {
            core.downloads.pause(id).await.context("Pause failed")?;
            println!("Paused download of capsule {}", id);
        }
        Command::Resume { id } => {
            core.downloads.resume(id).await.context("Resume failed")?;
            println!("Resumed download of capsule {}", id);
        }
        Command::Cancel { id } => {
            core.downloads.cancel(id).await.context("Cancel failed")?;
            println!("Cancelled download of capsule {}", id);
        }
        Command::Upload { ids } => {
            let outcome = core.uploads.upload(&ids).await.context("Upload failed")?;
            print_upload_outcome(&outcome);
        }
        Command::Reupload { id } => {
            let outcome = core.uploads.reupload(id).await.context("Re-upload failed")?;
            print_upload_outcome(&outcome);
        }
        Command::Pull => {
            let data = core.uploads.pull_remote().await.context("Pull failed")?;
            println!(
                "Pulled {} capsule(s), {} preview(s) in {:.1}s",
                data.synced_count, data.preview_downloaded, data.duration_seconds
            );
        }
        Command::BootSync => {
            let outcome = core.boot.run_with_skip(skip_signal()).await;
            match outcome {
                BootOutcome::Completed {
                    downloaded_count,
                    preview_downloaded,
                } => println!(
                    "Startup sync complete: {} capsule(s), {} preview(s)",
                    downloaded_count, preview_downloaded
                ),
                BootOutcome::Skipped(reason) => println!("Startup sync skipped ({:?})", reason),
                BootOutcome::Failed(message) => {
                    println!("Startup sync failed: {} (continuing)", message)
                }
                BootOutcome::AlreadyRan => println!("Startup sync already ran"),
            }
        }
        Command::SyncStatus => {
            let overview = core.monitor.refresh().await.context("Sync status failed")?;
            match overview.last_sync_at {
                Some(at) => println!("last sync:      {}", at.to_rfc3339()),
                None => println!("last sync:      never"),
            }
            println!("synced:         {}", overview.synced_count);
            println!("pending:        {}", overview.pending_count);
            println!("conflicts:      {}", overview.conflict_count);
            println!("remote pending: {}", overview.remote_pending);
        }
        Command::SyncTags => {
            let data = core.monitor.sync_tags().await.context("Tag sync failed")?;
            println!("Tags uploaded: {}, downloaded: {}", data.uploaded, data.downloaded);
        }
    }
    Ok(())
}

/// Minimal capsule record; the JIT gate resolves the status itself
fn capsule_stub(id: CapsuleId) -> Capsule {
    Capsule {
        id,
        name: String::new(),
        capsule_type: None,
        asset_status: AssetStatus::Unknown,
        cloud_status: CloudStatus::Unknown,
        audio_uploaded: false,
        use_count: 0,
        created_at: None,
        updated_at: None,
    }
}

fn print_upload_outcome(outcome: &UploadOutcome) {
    match outcome {
        UploadOutcome::Synced {
            synced_count,
            preview_downloaded,
            duration_seconds,
        } => println!(
            "Synced {} capsule(s), {} preview(s) in {:.1}s",
            synced_count, preview_downloaded, duration_seconds
        ),
        UploadOutcome::PartialWarning {
            message,
            synced_count,
            errors,
        } => {
            println!("Synced {} capsule(s) with warnings: {}", synced_count, message);
            for error in errors {
                println!("  - {}", error);
            }
        }
    }
}

/// Asks on the terminal whether to download or open offline
struct StdinPrompt;

#[async_trait]
impl DecisionPrompt for StdinPrompt {
    async fn choose(&self, capsule: &Capsule, status: AssetStatus) -> JitChoice {
        let question = format!(
            "{} is {}. [d]ownload then open, open [o]ffline, anything else cancels: ",
            capsule.display_name(),
            status
        );
        let answer = tokio::task::spawn_blocking(move || {
            let mut stderr = io::stderr();
            let _ = write!(stderr, "{}", question);
            let _ = stderr.flush();
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;

        match answer {
            Ok(Ok(line)) => match line.trim().to_ascii_lowercase().as_str() {
                "d" | "download" => JitChoice::DownloadThenOpen,
                "o" | "offline" => JitChoice::OpenOffline,
                _ => JitChoice::Dismiss,
            },
            _ => JitChoice::Dismiss,
        }
    }
}

/// Resolves on Ctrl+C; never resolves if the handler cannot be installed
async fn skip_signal() {
    if signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn init_tracing(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("capsule_sync={0},capsule_common={0}", level)));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };
    let stderr_layer = file_layer
        .is_none()
        .then(|| fmt::layer().with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

/// Print user-facing events to stderr until `stop` fires, then drain
fn spawn_notice_printer(bus: &EventBus, stop: CancellationToken) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(event) => print_event(&event),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                _ = stop.cancelled() => {
                    loop {
                        match rx.try_recv() {
                            Ok(event) => print_event(&event),
                            Err(TryRecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        }
                    }
                    break;
                }
            }
        }
    })
}

fn print_event(event: &CapsuleEvent) {
    match event {
        CapsuleEvent::Notice { level, message, .. } => {
            eprintln!("[{}] {}", level.label(), message);
        }
        CapsuleEvent::DownloadProgress { task, .. } => {
            eprintln!(
                "  {} {:>5.1}%  {} / {}  {}  eta {}",
                task.state,
                task.progress,
                format_size(task.downloaded_bytes),
                format_size(task.total_bytes),
                format_speed(task.speed),
                format_eta(task.eta_seconds)
            );
        }
        CapsuleEvent::UploadProgress { text, .. } => eprintln!("  {}", text),
        CapsuleEvent::BootSyncProgress {
            phase, percentage, ..
        } => eprintln!("  [{:>3}%] {}", percentage, phase),
        CapsuleEvent::AuthFailed { .. } => {
            eprintln!("[error] Session expired, please sign in again");
        }
        _ => {}
    }
}

/// Save refreshed (or cleared) tokens back to the config file
///
/// Only the `[auth]` table changes; CLI and environment overrides are not
/// written back.
fn persist_credentials(resolver: &ConfigResolver, credentials: Credentials) {
    let Some(path) = resolver.config_path() else {
        warn!("Credentials changed but no config path is known; not saved");
        return;
    };

    let mut on_disk = if path.exists() {
        match load_toml_config(&path) {
            Ok(config) => config,
            Err(err) => {
                warn!("Not saving credentials, {} is unreadable: {}", path.display(), err);
                return;
            }
        }
    } else {
        TomlConfig::default()
    };

    on_disk.auth.access_token = credentials.access_token;
    on_disk.auth.refresh_token = credentials.refresh_token;
    match write_toml_config(&on_disk, &path) {
        Ok(()) => info!("Saved updated credentials to {}", path.display()),
        Err(err) => warn!("Failed to save credentials to {}: {}", path.display(), err),
    }
}
