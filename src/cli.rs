use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::audit::verify_journal;
use crate::config::VaultConfig;
use crate::config_loader::{load_config, render_config};
use crate::recovery::RecoverySelection;
use crate::restore::RestoreRequest;
use crate::scheduler::BackupScheduler;
use crate::snapshot::SnapshotKind;
use crate::vault::{StartupState, Vault};

/// Top-level CLI interface for vaultkeeper
#[derive(Parser)]
#[command(
    name = "vaultkeeper",
    version,
    about = "Crash-safe document storage with snapshots, mirroring and tiered restore"
)]
pub struct Cli {
    /// Configuration file (defaults to vaultkeeper.toml or $VAULTKEEPER_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Keep data, snapshots and the journal under this directory
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the backup scheduler until interrupted, restoring on empty start
    Serve,

    /// Mirror connectivity, snapshot counts and document sizes
    Status,

    /// Create, list or delete snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotCommand,
    },

    /// Restore documents from the mirror or a local snapshot
    Restore {
        /// Snapshot id or manual snapshot name (newest when omitted)
        #[arg(long)]
        id: Option<String>,
        /// Restrict to one pool: auto, manual, or pre-restore to undo a restore
        #[arg(long)]
        kind: Option<SnapshotKind>,
    },

    /// Snapshot current state and push it to the mirror
    Sync,

    /// Scan a directory tree for stray document files
    Recover {
        #[arg(long, default_value = ".")]
        scan_root: PathBuf,
        /// Apply the proposed candidates (or the --select overrides)
        #[arg(long)]
        apply: bool,
        /// Override a pick: DOCUMENT=PATH (repeatable)
        #[arg(long = "select", value_name = "DOCUMENT=PATH")]
        select: Vec<String>,
        /// Write empty documents when nothing is recoverable
        #[arg(long)]
        seed_empty: bool,
    },

    /// Print a document as JSON
    Show { document: String },

    /// Operations journal tools
    Journal {
        #[command(subcommand)]
        action: JournalCommand,
    },

    /// Configuration tools
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand)]
pub enum SnapshotCommand {
    Create {
        #[arg(long, default_value = "manual")]
        kind: SnapshotKind,
        /// Operator-chosen name (manual snapshots only)
        #[arg(long)]
        name: Option<String>,
        /// Who requested the snapshot
        #[arg(long)]
        by: Option<String>,
    },
    List {
        #[arg(long, default_value = "auto")]
        kind: SnapshotKind,
    },
    Delete {
        #[arg(long, default_value = "manual")]
        kind: SnapshotKind,
        id: String,
    },
}

#[derive(Subcommand)]
pub enum JournalCommand {
    /// Walk the hash chain and report the first broken line
    Verify {
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration (token masked)
    Show,
}

fn resolve_config(cli: &Cli) -> anyhow::Result<VaultConfig> {
    let config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    Ok(match &cli.root {
        Some(root) => config.with_root(root),
        None => config,
    })
}

fn parse_selection(select: &[String]) -> anyhow::Result<RecoverySelection> {
    if select.is_empty() {
        return Ok(RecoverySelection::AcceptProposed);
    }
    let mut paths = BTreeMap::new();
    for item in select {
        let Some((document, path)) = item.split_once('=') else {
            bail!("--select expects DOCUMENT=PATH, got '{item}'");
        };
        paths.insert(document.to_string(), PathBuf::from(path));
    }
    Ok(RecoverySelection::Paths(paths))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = resolve_config(&cli)?;

    match cli.command {
        Commands::Config { action: ConfigCommand::Show } => {
            print!("{}", render_config(&config)?);
        }
        Commands::Journal {
            action: JournalCommand::Verify { path },
        } => {
            let Some(path) = path.or_else(|| config.storage.journal_path.clone()) else {
                bail!("no journal path configured");
            };
            let report = verify_journal(&path)?;
            match report.first_broken_line {
                None => println!("✅ Journal intact: {} entries", report.entries),
                Some(line) => bail!("❌ Journal chain broken at line {line} of {}", path.display()),
            }
        }
        command => run_vault_command(config, command).await?,
    }
    Ok(())
}

async fn run_vault_command(config: VaultConfig, command: Commands) -> anyhow::Result<()> {
    let interval = config.snapshots.auto_interval();
    let vault = Arc::new(Vault::open(config).context("failed to open vault")?);

    match command {
        Commands::Serve => {
            match vault.ensure_data().await? {
                StartupState::Existing => tracing::info!("live data present"),
                StartupState::Restored(report) => tracing::info!(
                    method = %report.method,
                    source = %report.source_id,
                    restored = report.restored_count,
                    "restored data at startup"
                ),
                StartupState::Seeded(names) => tracing::warn!(?names, "started with empty documents"),
            }

            let scheduler = BackupScheduler::start(Arc::clone(&vault), interval);
            tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown requested");

            scheduler.stop().await;
            let report = vault.shutdown().await?;
            println!(
                "Flushed {} documents, final snapshot {}",
                report.flushed,
                report.snapshot_id.as_deref().unwrap_or("not taken")
            );
        }
        Commands::Status => print_json(&vault.status().await?)?,
        Commands::Snapshot { action } => match action {
            SnapshotCommand::Create { kind, name, by } => {
                let result = vault.create_snapshot(kind, name.as_deref(), by.as_deref()).await?;
                println!(
                    "✅ Snapshot {} created ({}/{} documents)",
                    result.id(),
                    result.success_count(),
                    result.total_documents()
                );
                for doc in &result.metadata.documents {
                    println!("  {} {} ({} entries)", doc.status.symbol(), doc.name, doc.entity_count);
                }
                if !result.pruned.is_empty() {
                    println!("Pruned: {}", result.pruned.join(", "));
                }
            }
            SnapshotCommand::List { kind } => {
                let snapshots = vault.list_snapshots(kind)?;
                if snapshots.is_empty() {
                    println!("No {kind} snapshots");
                }
                for info in snapshots {
                    let (ok, total) = info
                        .metadata
                        .as_ref()
                        .map(|m| (m.success_count, m.total_documents))
                        .unwrap_or((0, 0));
                    println!("{}  {}  {ok}/{total}", info.created_at.to_rfc3339(), info.id);
                }
            }
            SnapshotCommand::Delete { kind, id } => {
                vault.delete_snapshot(kind, &id)?;
                println!("Deleted {kind} snapshot {id}");
            }
        },
        Commands::Restore { id, kind } => {
            let report = vault.restore(RestoreRequest { snapshot_id: id, kind }).await?;
            print_json(&report)?;
        }
        Commands::Sync => {
            let result = vault.sync_to_mirror().await;
            print_json(&result)?;
            if !result.success {
                bail!("mirror sync failed");
            }
        }
        Commands::Recover {
            scan_root,
            apply,
            select,
            seed_empty,
        } => {
            let plan = vault.scan_recovery(&scan_root).await?;
            print_json(&plan)?;

            if apply {
                let selection = parse_selection(&select)?;
                if plan.has_proposal() || matches!(selection, RecoverySelection::Paths(_)) {
                    print_json(&vault.apply_recovery(&plan, selection).await?)?;
                } else if seed_empty {
                    println!("Seeded: {:?}", vault.seed_empty()?);
                } else {
                    bail!("no valid candidates found under {}", scan_root.display());
                }
            }
        }
        Commands::Show { document } => {
            let doc = vault.load(&document)?;
            println!("{}", serde_json::to_string_pretty(&doc.body)?);
        }
        Commands::Journal { .. } | Commands::Config { .. } => {
            bail!("command does not operate on the vault")
        }
    }
    Ok(())
}
