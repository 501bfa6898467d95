use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tvault_blob_store::DirStore;
use tvault_core::{Level, Notification, Vault, VaultConfig};
use tvault_protocol::{FolderPath, ProgressStatus, TransferStatus};
use tvault_scheduler::TransferEvent;

#[derive(Parser)]
#[command(author, version, about = "tvault: a virtual file system over a blob store", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List a folder
    Ls {
        #[arg(default_value = "/")]
        folder: String,
        /// include every subfolder
        #[arg(short, long)]
        recursive: bool,
    },
    /// Create a folder
    Mkdir { parent: String, name: String },
    /// Delete a file by id
    Rm { id: String },
    /// Delete a folder and everything below it
    Rmdir { path: String },
    /// Move a file to another folder
    Mv { id: String, folder: String },
    /// Show folder stats, or totals for the whole vault
    Stats { path: Option<String> },
    /// Upload a local file
    Upload {
        local: PathBuf,
        #[arg(default_value = "/")]
        folder: String,
    },
    /// Download a file by id
    Download { id: String, dest: PathBuf },
    /// Rebuild the metadata document from the stored blobs
    Rebuild,
    /// Move files into per-folder containers
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tvault=debug")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting tvault");

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => VaultConfig::load_from(path),
        None => VaultConfig::load(),
    }
    .context("failed to load configuration")?;
    info!(data_dir = %config.data_dir.display(), "configuration loaded");

    let store = DirStore::open(config.data_dir.clone())
        .await
        .with_context(|| format!("failed to open store at {}", config.data_dir.display()))?;
    let mut vault = Vault::open(Arc::new(store), config).await?;

    if vault.is_blocked() && !matches!(cli.command, Commands::Rebuild) {
        error!("metadata document is unreadable");
        bail!("the metadata document is unreadable; run `tvault rebuild` to recover it");
    }

    let result = run(&mut vault, cli.command).await;
    for n in vault.take_notifications() {
        log_notification(&n);
    }
    if let Err(e) = &result {
        error!(error = %e, "command failed");
    }
    vault.shutdown();
    result
}

/// Emits a vault notification as a log event of matching severity.
fn log_notification(n: &Notification) {
    let detail = n.message.as_deref().unwrap_or_default();
    match n.level {
        Level::Error => error!(title = %n.title, detail, "notification"),
        Level::Warning => warn!(title = %n.title, detail, "notification"),
        Level::Success | Level::Info => info!(title = %n.title, detail, "notification"),
    }
}

async fn run(vault: &mut Vault, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Ls { folder, recursive } => {
            let listing = vault.list(&folder_path(&folder)?, recursive).await?;
            for f in &listing.folders {
                println!("{f}/");
            }
            for file in &listing.files {
                let location = if recursive {
                    format!("{}/{}", file.folder.as_str().trim_end_matches('/'), file.name)
                } else {
                    file.name.clone()
                };
                println!("{:>10}  {}  {location}", format_size(file.size), file.id);
            }
        }
        Commands::Mkdir { parent, name } => {
            let path = vault.create_folder(&folder_path(&parent)?, &name).await?;
            println!("created {path}");
        }
        Commands::Rm { id } => {
            let record = vault.delete_file(&id).await?;
            println!("deleted {}", record.name);
        }
        Commands::Rmdir { path } => {
            let removal = vault.delete_folder(&folder_path(&path)?).await?;
            println!(
                "deleted {} folder(s) and {} file(s)",
                removal.folders.len(),
                removal.files.len()
            );
        }
        Commands::Mv { id, folder } => {
            let record = vault.move_file(&id, &folder_path(&folder)?).await?;
            println!("moved {} to {}", record.name, record.folder);
        }
        Commands::Stats { path: Some(path) } => {
            let stats = vault.folder_stats(&folder_path(&path)?).await?;
            println!("{} file(s), {}", stats.file_count, format_size(stats.total_size));
        }
        Commands::Stats { path: None } => {
            let stats = vault.storage_stats().await?;
            println!(
                "{} file(s) in {} folder(s), {}",
                stats.total_files,
                stats.folder_count,
                format_size(stats.total_size)
            );
        }
        Commands::Upload { local, folder } => {
            let id = vault.enqueue_upload(&local, &folder_path(&folder)?, false).await?;
            wait_for(vault, &id).await?;
        }
        Commands::Download { id, dest } => {
            let transfer = vault.enqueue_download(&id, &dest).await?;
            wait_for(vault, &transfer).await?;
            println!("saved {}", dest.display());
        }
        Commands::Rebuild => {
            let report = vault.rebuild_metadata().await?;
            println!("recovered {} file(s)", report.discovered);
            for missing in &report.incomplete {
                println!(
                    "  skipped {} ({}): {}/{} chunk(s), {:?}",
                    missing.name, missing.container, missing.present, missing.total, missing.reason
                );
            }
            if report.ignored_blobs > 0 {
                println!("ignored {} unrelated blob(s)", report.ignored_blobs);
            }
        }
        Commands::Migrate => {
            let (tx, mut rx) = mpsc::channel::<tvault_protocol::MigrationProgress>(16);
            let printer = tokio::spawn(async move {
                while let Some(p) = rx.recv().await {
                    println!("[{}/{}] {}", p.current, p.total, p.file);
                }
            });
            let report = vault.migrate_to_folder_containers(Some(tx)).await?;
            let _ = printer.await;
            println!(
                "{} migrated, {} failed, {} skipped",
                report.migrated, report.failed, report.skipped
            );
        }
    }
    Ok(())
}

/// Prints progress for one transfer until the queue drains.
async fn wait_for(vault: &mut Vault, transfer_id: &str) -> anyhow::Result<()> {
    if let Some(mut events) = vault.take_transfer_events() {
        let id = transfer_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let TransferEvent::Progress(p) = event {
                    if p.id == id && p.status != ProgressStatus::Error {
                        println!(
                            "{:>3}%  {} / {}",
                            p.progress,
                            format_size(p.current),
                            format_size(p.total)
                        );
                    }
                }
            }
        });
    }

    vault.wait_for_transfers().await;

    let Some(item) = vault.transfers().into_iter().find(|i| i.id == transfer_id) else {
        bail!("transfer {transfer_id} disappeared");
    };
    match item.status {
        TransferStatus::Completed => {
            if let Some(file_id) = item.file_id {
                println!("{} -> {file_id}", item.name);
            }
            Ok(())
        }
        _ => bail!(
            "{} failed: {}",
            item.name,
            item.error.unwrap_or_else(|| "unknown error".into())
        ),
    }
}

fn folder_path(raw: &str) -> anyhow::Result<FolderPath> {
    FolderPath::parse(raw).with_context(|| format!("invalid folder path {raw:?}"))
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
