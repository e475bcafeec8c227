use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;

use core_updater::core::config::{AppPaths, ConfigService, UpdaterConfig};
use core_updater::core::errors::WorkflowError;
use core_updater::discovery::{
    discover_targets, is_handheld_host, recommended_target, validate_installation_path,
};
use core_updater::logging;
use core_updater::manifest::{ManifestClient, VersionManifest};
use core_updater::workflow::{format_bytes, BackupPolicy, WorkflowEngine, WorkflowOptions};

#[derive(Parser)]
#[command(name = "core-updater", about = "Install RetroArch cores from the libretro buildbot", long_about = None)]
struct Cli {
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List versions offered by the buildbot, newest first
    Versions,
    /// List RetroArch core directories found on this machine
    Targets,
    /// Show the archive URL and size for a version
    Info {
        #[arg(long)]
        version: Option<String>,
    },
    /// Back up the current cores, then download and install a version
    Install(InstallArgs),
}

#[derive(Args)]
struct InstallArgs {
    /// Defaults to the newest version
    #[arg(long)]
    version: Option<String>,
    /// Core directory; defaults to the last one used, then the recommended one
    #[arg(long)]
    target: Option<PathBuf>,
    /// timestamp-suffix, overwrite or refuse
    #[arg(long)]
    backup_policy: Option<BackupPolicy>,
    /// Also install the core info files
    #[arg(long)]
    with_core_info: bool,
    /// Print the outcome as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = Arc::new(AppPaths::new());
    logging::init(&paths, cli.verbose);
    let config = ConfigService::new(paths);

    let code = match cli.command {
        Command::Versions => list_versions(&config).await?,
        Command::Targets => list_targets(),
        Command::Info { version } => show_info(&config, version).await?,
        Command::Install(args) => install(&config, args).await?,
    };
    std::process::exit(code)
}

async fn fetch_manifest(settings: &UpdaterConfig) -> anyhow::Result<VersionManifest> {
    let client = ManifestClient::new(settings.manifest.clone())?;
    client
        .fetch()
        .await
        .with_context(|| format!("Failed to fetch versions from {}", settings.manifest.base_url))
}

fn resolve_version(manifest: &VersionManifest, requested: Option<String>) -> anyhow::Result<String> {
    match requested {
        Some(version) => Ok(version),
        None => manifest
            .latest()
            .map(str::to_string)
            .context("Manifest lists no versions"),
    }
}

async fn list_versions(config: &ConfigService) -> anyhow::Result<i32> {
    let settings = config.settings()?;
    let manifest = fetch_manifest(&settings).await?;
    for (index, version) in manifest.versions().iter().enumerate() {
        if index == 0 {
            println!("{} (latest)", version);
        } else {
            println!("{}", version);
        }
    }
    Ok(0)
}

fn list_targets() -> i32 {
    let targets = discover_targets();
    if targets.is_empty() {
        if is_handheld_host() {
            println!("No RetroArch installation found. Install RetroArch from Steam first.");
        } else {
            println!("No RetroArch installation found; pass --target to install elsewhere.");
        }
        return 0;
    }
    let recommended = recommended_target(&targets).map(|target| target.path.clone());
    for target in &targets {
        let marker = if Some(&target.path) == recommended.as_ref() {
            "*"
        } else {
            " "
        };
        let free = target
            .free_space
            .map(format_bytes)
            .unwrap_or_else(|| "unknown".to_string());
        let access = if target.writable { "writable" } else { "read-only" };
        println!(
            "{} {:<24} {} ({}, {} free)",
            marker,
            target.display_name,
            target.path.display(),
            access,
            free
        );
    }
    0
}

async fn show_info(config: &ConfigService, version: Option<String>) -> anyhow::Result<i32> {
    let settings = config.settings()?;
    let manifest = fetch_manifest(&settings).await?;
    let version = resolve_version(&manifest, version)?;
    if !manifest.contains(&version) {
        let err = WorkflowError::UnknownVersion(version);
        eprintln!("{}", err);
        return Ok(err.exit_code());
    }

    let client = ManifestClient::new(settings.manifest.clone())?;
    let info = client.archive_info(&manifest, &version).await;
    println!("version:   {}", info.version);
    println!("url:       {}", info.url);
    println!(
        "size:      {}",
        info.size.map(format_bytes).unwrap_or_else(|| "unknown".to_string())
    );
    println!("available: {}", if info.available { "yes" } else { "no" });
    Ok(0)
}

fn resolve_target(settings: &UpdaterConfig, requested: Option<PathBuf>) -> Option<PathBuf> {
    requested
        .or_else(|| {
            settings
                .last_selection
                .target
                .clone()
                .filter(|path| path.is_dir())
        })
        .or_else(|| recommended_target(&discover_targets()).map(|target| target.path.clone()))
}

async fn install(config: &ConfigService, args: InstallArgs) -> anyhow::Result<i32> {
    let mut settings = config.settings()?;
    if let Some(policy) = args.backup_policy {
        settings.install.backup_policy = policy;
    }
    if args.with_core_info {
        settings.core_info.enabled = true;
    }

    let Some(target) = resolve_target(&settings, args.target) else {
        let err = WorkflowError::invalid_target(
            Path::new("<none>"),
            "no RetroArch installation found; pass --target",
        );
        eprintln!("{}", err);
        return Ok(err.exit_code());
    };
    if !validate_installation_path(&target) {
        tracing::warn!(target = %target.display(), "Target does not sit next to a RetroArch install");
    }

    let manifest = fetch_manifest(&settings).await?;
    let version = resolve_version(&manifest, args.version)?;
    let engine = WorkflowEngine::new(manifest, WorkflowOptions::from_config(&settings))?;

    let (sender, mut events) = mpsc::unbounded_channel();
    let handle = match engine.start(&version, &target, sender) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("{}", err);
            return Ok(err.exit_code());
        }
    };

    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling; the current step will finish first...");
            cancel.cancel();
        }
    });

    while let Some(event) = events.recv().await {
        println!("[{:>3}%] {}", event.percentage, event.message);
    }

    match handle.join().await {
        Ok(outcome) => {
            if let Err(err) = config.record_selection(&outcome.version, &outcome.target_dir) {
                tracing::warn!(error = %err, "Failed to remember selection");
            }
            if args.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            }
            Ok(0)
        }
        Err(err) => {
            eprintln!("{}", err);
            Ok(err.exit_code())
        }
    }
}
